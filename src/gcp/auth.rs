//! GCP Authentication
//!
//! Picks the active credential mode (static access token, JSON credentials,
//! or ambient default credentials), optionally wraps it in service account
//! impersonation, and hands out cached bearer tokens.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gcp_auth::TokenProvider;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;

use crate::config::ResolvedConfig;
use crate::error::{ApiError, Error, Result};
use crate::gcp::endpoints::DEFAULT_UNIVERSE_DOMAIN;
use crate::gcp::http::DEFAULT_REQUEST_TIMEOUT;

/// Scopes requested when the configuration does not list any.
pub const DEFAULT_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/cloud-platform",
    "https://www.googleapis.com/auth/userinfo.email",
];

/// Scope the base credential needs to mint impersonated tokens.
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Lifetime requested for impersonated tokens.
const IMPERSONATED_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Token expiry buffer - refresh tokens this much before they actually expire
const TOKEN_EXPIRY_BUFFER: Duration = Duration::from_secs(60);

/// Default token TTL if we can't determine expiry (conservative: 30 minutes)
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

const KNOWN_CREDENTIAL_TYPES: &[&str] = &[
    "service_account",
    "authorized_user",
    "external_account",
    "external_account_authorized_user",
    "impersonated_service_account",
    "gdch_service_account",
];

// =========================================================================
// Credential selection
// =========================================================================

/// Which authentication mechanism is active. Chosen by precedence, never
/// by merging two sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CredentialMode {
    AccessToken,
    JsonCredentials,
    AmbientDefault,
}

impl CredentialMode {
    /// Access token, then JSON credentials, then ambient default credentials.
    pub fn select(access_token: Option<&str>, credentials: Option<&str>) -> Self {
        let present = |v: Option<&str>| v.is_some_and(|s| !s.is_empty());
        if present(access_token) {
            CredentialMode::AccessToken
        } else if present(credentials) {
            CredentialMode::JsonCredentials
        } else {
            CredentialMode::AmbientDefault
        }
    }
}

/// Reject a configuration that sets both `access_token` and `credentials`.
///
/// Only explicit configuration values are considered; environment variables
/// play no part in this check.
pub fn check_credential_conflict(access_token: Option<&str>, credentials: Option<&str>) -> Result<()> {
    if access_token.is_some_and(|s| !s.is_empty()) && credentials.is_some_and(|s| !s.is_empty()) {
        return Err(Error::validation(
            "credentials",
            "conflicts with access_token: only one of credentials or access_token may be set",
        ));
    }
    Ok(())
}

/// Fields of a credentials file that matter before minting a token.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsFile {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub client_email: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub universe_domain: Option<String>,
}

impl CredentialsFile {
    pub fn parse(contents: &str) -> std::result::Result<Self, String> {
        let file: CredentialsFile = serde_json::from_str(contents).map_err(|e| e.to_string())?;
        if !KNOWN_CREDENTIAL_TYPES.contains(&file.kind.as_str()) {
            return Err(format!("unknown credential type: {:?}", file.kind));
        }
        Ok(file)
    }
}

/// Validate a `credentials` value.
///
/// An existing path is accepted without reading it. Anything else must parse
/// as credential JSON.
pub fn validate_credentials(value: &str) -> Result<()> {
    if expand_home(value).exists() {
        return Ok(());
    }
    CredentialsFile::parse(value)
        .map(|_| ())
        .map_err(|e| Error::validation("credentials", format!("JSON credentials are not valid: {e}")))
}

/// Return the file's contents when `value` names a readable file, else `value`.
pub fn path_or_contents(value: &str) -> Result<String> {
    let path = expand_home(value);
    if path.is_file() {
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            Error::authentication(format!("cannot read {}: {}", path.display(), e))
        })?;
        return Ok(contents.trim().to_string());
    }
    Ok(value.to_string())
}

fn expand_home(value: &str) -> PathBuf {
    match value.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(value)),
        None => PathBuf::from(value),
    }
}

// =========================================================================
// Token sources
// =========================================================================

/// A bearer token together with its expiry, when known.
#[derive(Debug, Clone)]
pub struct MintedToken {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Anything that can mint bearer tokens for a set of scopes.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self, scopes: &[String]) -> Result<MintedToken>;
}

/// A fixed token supplied by the user.
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self, _scopes: &[String]) -> Result<MintedToken> {
        Ok(MintedToken {
            token: self.token.clone(),
            expires_at: None,
        })
    }
}

/// Tokens from a `gcp_auth` provider (service account key or ambient ADC).
pub struct ProviderTokenSource {
    provider: Arc<dyn TokenProvider>,
}

impl ProviderTokenSource {
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self { provider }
    }

    /// Application Default Credentials discovered on the host.
    pub async fn ambient() -> Result<Self> {
        let provider = gcp_auth::provider().await.map_err(|e| {
            Error::authentication(format!(
                "no ambient default credentials found ({e}); run 'gcloud auth application-default login'"
            ))
        })?;
        Ok(Self::new(provider))
    }

    /// A service account key given as JSON.
    pub fn from_service_account_json(contents: &str) -> Result<Self> {
        let account = gcp_auth::CustomServiceAccount::from_json(contents)
            .map_err(|e| Error::authentication(format!("invalid service account key: {e}")))?;
        Ok(Self::new(Arc::new(account)))
    }
}

#[async_trait]
impl TokenSource for ProviderTokenSource {
    async fn token(&self, scopes: &[String]) -> Result<MintedToken> {
        let scopes: Vec<&str> = scopes.iter().map(String::as_str).collect();
        let token = self
            .provider
            .token(&scopes)
            .await
            .map_err(|e| Error::authentication(format!("failed to get access token: {e}")))?;
        Ok(MintedToken {
            token: token.as_str().to_string(),
            expires_at: None,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateAccessTokenResponse {
    access_token: String,
    expire_time: DateTime<Utc>,
}

/// Mints tokens for a target service account using a base credential,
/// optionally through a chain of delegates.
pub struct ImpersonatedTokenSource {
    base: Arc<dyn TokenSource>,
    target: String,
    delegates: Vec<String>,
    iamcredentials_base: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl ImpersonatedTokenSource {
    pub fn new(
        base: Arc<dyn TokenSource>,
        target: impl Into<String>,
        delegates: Vec<String>,
        iamcredentials_base: impl Into<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            base,
            target: target.into(),
            delegates,
            iamcredentials_base: iamcredentials_base.into(),
            http,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Bound on each `generateAccessToken` round trip.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn failure(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout(self.timeout)
        } else {
            Error::authentication(format!("impersonating {}: {}", self.target, err))
        }
    }

    fn endpoint(&self) -> String {
        let base = self.iamcredentials_base.trim_end_matches('/');
        format!(
            "{}/projects/-/serviceAccounts/{}:generateAccessToken",
            base, self.target
        )
    }
}

#[async_trait]
impl TokenSource for ImpersonatedTokenSource {
    async fn token(&self, scopes: &[String]) -> Result<MintedToken> {
        let base_token = self.base.token(&[CLOUD_PLATFORM_SCOPE.to_string()]).await?;
        let delegates: Vec<String> = self
            .delegates
            .iter()
            .map(|d| format!("projects/-/serviceAccounts/{d}"))
            .collect();
        let body = json!({
            "delegates": delegates,
            "scope": scopes,
            "lifetime": format!("{}s", IMPERSONATED_TOKEN_LIFETIME.as_secs()),
        });

        let url = self.endpoint();
        tracing::debug!("POST {}", url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&base_token.token)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.failure(e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| self.failure(e))?;
        if !status.is_success() {
            let api = ApiError::from_response(status.as_u16(), text);
            return Err(Error::authentication(format!(
                "impersonating {}: {}",
                self.target, api
            )));
        }

        let minted: GenerateAccessTokenResponse = serde_json::from_str(&text).map_err(|e| {
            Error::authentication(format!("impersonating {}: malformed response: {}", self.target, e))
        })?;
        Ok(MintedToken {
            token: minted.access_token,
            expires_at: Some(minted.expire_time),
        })
    }
}

// =========================================================================
// Authenticator
// =========================================================================

#[derive(Clone)]
struct CachedToken {
    token: String,
    /// When this token expires (with buffer applied)
    expires_at: Instant,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// The credential attached to a resolved configuration.
#[derive(Clone)]
pub struct Authenticator {
    mode: CredentialMode,
    source: Arc<dyn TokenSource>,
    scopes: Vec<String>,
    impersonated: Option<String>,
    request_timeout: Duration,
    token_cache: Arc<RwLock<Option<CachedToken>>>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("mode", &self.mode)
            .field("scopes", &self.scopes)
            .field("impersonated", &self.impersonated)
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    pub fn new(mode: CredentialMode, source: Arc<dyn TokenSource>, scopes: Vec<String>) -> Self {
        Self {
            mode,
            source,
            scopes,
            impersonated: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            token_cache: Arc::new(RwLock::new(None)),
        }
    }

    /// Timeout for token requests this authenticator sends itself. Zero
    /// keeps the default.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.request_timeout = timeout;
        }
        self
    }

    /// Build the authenticator for a resolved configuration.
    pub async fn from_config(config: &ResolvedConfig, http: &reqwest::Client) -> Result<Self> {
        let mode = config.credential_mode();
        let source: Arc<dyn TokenSource> = match mode {
            CredentialMode::AccessToken => {
                let raw = config.access_token().unwrap_or_default();
                Arc::new(StaticTokenSource::new(path_or_contents(raw)?))
            }
            CredentialMode::JsonCredentials => {
                let raw = config.credentials().unwrap_or_default();
                let contents = path_or_contents(raw)?;
                let file = CredentialsFile::parse(&contents).map_err(|e| {
                    Error::validation("credentials", format!("JSON credentials are not valid: {e}"))
                })?;
                check_universe_domain(config.universe_domain(), file.universe_domain.as_deref())?;
                if file.kind != "service_account" {
                    return Err(Error::authentication(format!(
                        "credential type {:?} cannot mint tokens directly; use a service account key or ambient credentials",
                        file.kind
                    )));
                }
                Arc::new(ProviderTokenSource::from_service_account_json(&contents)?)
            }
            CredentialMode::AmbientDefault => Arc::new(ProviderTokenSource::ambient().await?),
        };
        tracing::info!("Authenticating with {:?}", mode);

        let mut auth = Self::new(mode, source, config.scopes().to_vec())
            .with_request_timeout(config.request_timeout());
        if let Some(target) = config.impersonate_service_account() {
            let base = config.base_paths().resolve("IamCredentials")?;
            auth = auth.chain_impersonation(
                target,
                config.impersonate_service_account_delegates().to_vec(),
                base,
                http.clone(),
            );
        }
        Ok(auth)
    }

    /// Layer impersonation of `target` on top of the current credential.
    pub fn chain_impersonation(
        self,
        target: &str,
        delegates: Vec<String>,
        iamcredentials_base: &str,
        http: reqwest::Client,
    ) -> Self {
        tracing::info!(
            "Impersonating {} through {} delegate(s)",
            target,
            delegates.len()
        );
        let source = ImpersonatedTokenSource::new(
            self.source,
            target,
            delegates,
            iamcredentials_base,
            http,
        )
        .with_timeout(self.request_timeout);
        Self {
            mode: self.mode,
            source: Arc::new(source),
            scopes: self.scopes,
            impersonated: Some(target.to_string()),
            request_timeout: self.request_timeout,
            token_cache: Arc::new(RwLock::new(None)),
        }
    }

    pub fn mode(&self) -> CredentialMode {
        self.mode
    }

    pub fn impersonated_account(&self) -> Option<&str> {
        self.impersonated.as_deref()
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Get an access token for API calls, reusing the cached one while valid.
    pub async fn get_token(&self) -> Result<String> {
        {
            let cache = self.token_cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.is_valid() {
                    return Ok(cached.token.clone());
                }
                tracing::debug!("Cached token expired, fetching new token");
            }
        }

        let minted = self.source.token(&self.scopes).await?;
        let ttl = minted
            .expires_at
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .unwrap_or(DEFAULT_TOKEN_TTL);
        let expires_at = Instant::now() + ttl.saturating_sub(TOKEN_EXPIRY_BUFFER);

        {
            let mut cache = self.token_cache.write().await;
            *cache = Some(CachedToken {
                token: minted.token.clone(),
                expires_at,
            });
        }

        tracing::debug!(
            "New token cached, expires in ~{} minutes",
            ttl.saturating_sub(TOKEN_EXPIRY_BUFFER).as_secs() / 60
        );

        Ok(minted.token)
    }

    /// Force refresh the token
    pub async fn refresh_token(&self) -> Result<String> {
        {
            let mut cache = self.token_cache.write().await;
            *cache = None;
        }
        self.get_token().await
    }
}

fn check_universe_domain(configured: Option<&str>, in_credentials: Option<&str>) -> Result<()> {
    let configured = configured.unwrap_or(DEFAULT_UNIVERSE_DOMAIN);
    let in_credentials = in_credentials.unwrap_or(DEFAULT_UNIVERSE_DOMAIN);
    if configured != in_credentials {
        return Err(Error::validation(
            "universe_domain",
            format!(
                "universe domain mismatch: {configured:?} supplied directly, but {in_credentials:?} found in credentials"
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        ttl: Option<chrono::Duration>,
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn token(&self, _scopes: &[String]) -> Result<MintedToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(MintedToken {
                token: format!("token-{n}"),
                expires_at: self.ttl.map(|ttl| Utc::now() + ttl),
            })
        }
    }

    #[test]
    fn test_select_precedence() {
        assert_eq!(
            CredentialMode::select(Some("tok"), Some("{}")),
            CredentialMode::AccessToken
        );
        assert_eq!(
            CredentialMode::select(None, Some("creds.json")),
            CredentialMode::JsonCredentials
        );
        assert_eq!(
            CredentialMode::select(Some(""), None),
            CredentialMode::AmbientDefault
        );
    }

    #[test]
    fn test_conflict_is_rejected() {
        let err = check_credential_conflict(Some("tok"), Some("creds.json")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(check_credential_conflict(Some("tok"), None).is_ok());
        assert!(check_credential_conflict(None, Some("creds.json")).is_ok());
    }

    #[test]
    fn test_existing_path_short_circuits_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "this is not json").unwrap();
        assert!(validate_credentials(file.path().to_str().unwrap()).is_ok());
    }

    #[test]
    fn test_invalid_json_credentials() {
        let err = validate_credentials("not-a-path-and-not-json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("JSON credentials are not valid"));

        let err = validate_credentials(r#"{"type": "bogus"}"#).unwrap_err();
        assert!(err.to_string().contains("unknown credential type"));

        assert!(validate_credentials(r#"{"type": "service_account"}"#).is_ok());
    }

    #[test]
    fn test_path_or_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ya29.from-file").unwrap();
        assert_eq!(
            path_or_contents(file.path().to_str().unwrap()).unwrap(),
            "ya29.from-file"
        );
        assert_eq!(path_or_contents("ya29.inline").unwrap(), "ya29.inline");
    }

    #[test]
    fn test_universe_domain_check() {
        assert!(check_universe_domain(None, None).is_ok());
        assert!(check_universe_domain(Some("googleapis.com"), None).is_ok());
        assert!(check_universe_domain(Some("u.example"), Some("u.example")).is_ok());
        let err = check_universe_domain(None, Some("u.example")).unwrap_err();
        assert!(err.to_string().contains("universe domain mismatch"));
    }

    #[tokio::test]
    async fn test_token_is_cached() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            ttl: None,
        });
        let auth = Authenticator::new(CredentialMode::AccessToken, source.clone(), vec![]);
        assert_eq!(auth.get_token().await.unwrap(), "token-0");
        assert_eq!(auth.get_token().await.unwrap(), "token-0");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        assert_eq!(auth.refresh_token().await.unwrap(), "token-1");
    }

    #[tokio::test]
    async fn test_nearly_expired_token_is_not_cached() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            ttl: Some(chrono::Duration::seconds(30)),
        });
        let auth = Authenticator::new(CredentialMode::JsonCredentials, source.clone(), vec![]);
        auth.get_token().await.unwrap();
        auth.get_token().await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_static_source_ignores_scopes() {
        let source = StaticTokenSource::new("abc");
        let token = source.token(&["x".to_string()]).await.unwrap();
        assert_eq!(token.token, "abc");
        assert!(token.expires_at.is_none());
    }
}
