//! Provider configuration
//!
//! Turns a raw [`ProviderBlock`] plus an [`Environment`] snapshot into an
//! immutable [`ResolvedConfig`]. Resolution happens once per provider
//! activation; the result is shared read-only by every concurrent operation.
//!
//! # Module Structure
//!
//! - [`env`] - environment snapshot
//! - [`input`] - string-keyed provider block parsing
//! - [`resolver`] - per-field precedence resolution and value parsing

pub mod env;
pub mod input;
pub mod resolver;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

pub use env::Environment;
pub use input::{BatchingBlock, BoolLike, ProviderBlock};

use crate::error::{Error, Result};
use crate::gcp::auth::{self, CredentialMode, DEFAULT_SCOPES};
use crate::gcp::endpoints::{detect_mtls, BasePaths, MtlsDetector};
use resolver::{parse_bool, parse_duration, region_from_self_link, resolve};

/// Debounce window used when `batching.send_after` is not set.
pub const DEFAULT_BATCH_SEND_AFTER: Duration = Duration::from_secs(3);

/// Variable appended to the user agent.
pub const USER_AGENT_EXTENSION_ENV: &str = "GOOGLE_TERRAFORM_USERAGENT_EXTENSION";

/// Quota project variable honoured by the lower client layer.
pub const QUOTA_PROJECT_ENV: &str = "GOOGLE_CLOUD_QUOTA_PROJECT";

pub const ATTRIBUTION_LABEL_KEY: &str = "goog-terraform-provisioned";
pub const ATTRIBUTION_LABEL_VALUE: &str = "true";

fn base_user_agent() -> String {
    format!("gcp-provider-core/{}", env!("CARGO_PKG_VERSION"))
}

/// Debounce policy for batchable calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchingConfig {
    pub enabled: bool,
    pub send_after: Duration,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            send_after: DEFAULT_BATCH_SEND_AFTER,
        }
    }
}

/// When the provisioning attribution label is added to resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttributionStrategy {
    #[default]
    CreationOnly,
    Proactive,
}

impl AttributionStrategy {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "CREATION_ONLY" => Ok(AttributionStrategy::CreationOnly),
            "PROACTIVE" => Ok(AttributionStrategy::Proactive),
            other => Err(Error::validation(
                "terraform_attribution_label_addition_strategy",
                format!("unrecognized terraform_attribution_label_addition_strategy {other:?}"),
            )),
        }
    }
}

/// Fully resolved, immutable provider configuration.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    credential_mode: CredentialMode,
    access_token: Option<String>,
    credentials: Option<String>,
    impersonate_service_account: Option<String>,
    impersonate_service_account_delegates: Vec<String>,
    project: Option<String>,
    region: Option<String>,
    zone: Option<String>,
    billing_project: Option<String>,
    scopes: Vec<String>,
    user_agent: String,
    request_timeout: Duration,
    request_reason: Option<String>,
    base_paths: BasePaths,
    user_project_override: bool,
    batching: BatchingConfig,
    universe_domain: Option<String>,
    quota_project_env: Option<String>,
    default_labels: BTreeMap<String, String>,
    add_attribution_label: bool,
    attribution_strategy: AttributionStrategy,
}

impl ResolvedConfig {
    /// Resolve a provider block against an environment snapshot.
    ///
    /// Every validation error is reported here, before any network I/O.
    pub fn resolve(block: &ProviderBlock, env: &Environment, mtls: &dyn MtlsDetector) -> Result<Self> {
        // Schema-level conflict, independent of the environment.
        auth::check_credential_conflict(block.access_token.as_deref(), block.credentials.as_deref())?;

        // The credential env vars only apply when neither field is configured.
        let empty_env = Environment::empty();
        let credential_env = if block.access_token.is_some() || block.credentials.is_some() {
            &empty_env
        } else {
            env
        };
        let access_token = resolve(
            &resolver::ACCESS_TOKEN,
            block.access_token.as_deref(),
            credential_env,
            None,
        )?
        .value;
        let credentials = resolve(
            &resolver::CREDENTIALS,
            block.credentials.as_deref(),
            credential_env,
            None,
        )?
        .value;
        if let Some(creds) = credentials.as_deref() {
            auth::validate_credentials(creds)?;
        }
        let credential_mode = CredentialMode::select(access_token.as_deref(), credentials.as_deref());

        let impersonate_service_account = resolve(
            &resolver::IMPERSONATE_SERVICE_ACCOUNT,
            block.impersonate_service_account.as_deref(),
            env,
            None,
        )?
        .value;
        let impersonate_service_account_delegates =
            block.impersonate_service_account_delegates.clone().unwrap_or_default();
        if impersonate_service_account_delegates.iter().any(String::is_empty) {
            return Err(Error::validation(
                "impersonate_service_account_delegates",
                "expected a non-empty string",
            ));
        }

        let project = resolve(&resolver::PROJECT, block.project.as_deref(), env, None)?.value;
        let region = resolve(&resolver::REGION, block.region.as_deref(), env, None)?
            .value
            .map(|r| region_from_self_link(&r));
        let zone = resolve(&resolver::ZONE, block.zone.as_deref(), env, None)?.value;
        let billing_project =
            resolve(&resolver::BILLING_PROJECT, block.billing_project.as_deref(), env, None)?.value;

        let override_raw = block
            .user_project_override
            .as_ref()
            .and_then(BoolLike::as_config_str);
        let user_project_override = resolve(
            &resolver::USER_PROJECT_OVERRIDE,
            override_raw.as_deref(),
            env,
            None,
        )?
        .parse_with(parse_bool)?
        .value
        .unwrap_or(false);

        let scopes = match block.scopes.as_deref() {
            Some(scopes) if !scopes.is_empty() => {
                if scopes.iter().any(String::is_empty) {
                    return Err(Error::validation("scopes", "expected a non-empty string"));
                }
                scopes.to_vec()
            }
            _ => DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
        };

        let request_timeout = resolve(
            &resolver::REQUEST_TIMEOUT,
            block.request_timeout.as_deref(),
            env,
            Some("0s"),
        )?
        .parse_with(parse_duration)?
        .value
        .unwrap_or(Duration::ZERO);

        let request_reason =
            resolve(&resolver::REQUEST_REASON, block.request_reason.as_deref(), env, None)?.value;

        let batching_block = block.batching.clone().unwrap_or_default();
        let send_after = resolve(
            &resolver::SEND_AFTER,
            batching_block.send_after.as_deref(),
            env,
            None,
        )?
        .parse_with(parse_duration)?
        .value
        .unwrap_or(DEFAULT_BATCH_SEND_AFTER);
        let batching = BatchingConfig {
            enabled: batching_block.enable_batching.unwrap_or(true),
            send_after,
        };

        let universe_domain = block.universe_domain.clone().filter(|d| !d.is_empty());

        let mut user_agent = base_user_agent();
        if let Some(ext) = env.get(USER_AGENT_EXTENSION_ENV) {
            user_agent = format!("{} {}", user_agent, ext.trim());
        }

        let attribution_strategy = match block
            .terraform_attribution_label_addition_strategy
            .as_deref()
        {
            Some(s) if !s.is_empty() => AttributionStrategy::parse(s)?,
            _ => AttributionStrategy::default(),
        };

        let overrides = block.custom_endpoints()?;
        let base_paths = BasePaths::build(&overrides, detect_mtls(mtls), universe_domain.as_deref())?;

        let config = Self {
            credential_mode,
            access_token,
            credentials,
            impersonate_service_account,
            impersonate_service_account_delegates,
            project,
            region,
            zone,
            billing_project,
            scopes,
            user_agent,
            request_timeout,
            request_reason,
            base_paths,
            user_project_override,
            batching,
            universe_domain,
            quota_project_env: env.get(QUOTA_PROJECT_ENV).map(str::to_string),
            default_labels: block.default_labels.clone().unwrap_or_default(),
            add_attribution_label: block.add_terraform_attribution_label.unwrap_or(false),
            attribution_strategy,
        };
        tracing::info!(
            "Resolved provider config: mode={:?} project={:?} region={:?} zone={:?} mtls={}",
            config.credential_mode,
            config.project,
            config.region,
            config.zone,
            config.base_paths.is_mtls()
        );
        Ok(config)
    }

    pub fn credential_mode(&self) -> CredentialMode {
        self.credential_mode
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    /// The configured credentials. Never populated by ambient discovery.
    pub fn credentials(&self) -> Option<&str> {
        self.credentials.as_deref()
    }

    pub fn impersonate_service_account(&self) -> Option<&str> {
        self.impersonate_service_account.as_deref()
    }

    pub fn impersonate_service_account_delegates(&self) -> &[String] {
        &self.impersonate_service_account_delegates
    }

    pub fn project(&self) -> Option<&str> {
        self.project.as_deref()
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    pub fn zone(&self) -> Option<&str> {
        self.zone.as_deref()
    }

    pub fn billing_project(&self) -> Option<&str> {
        self.billing_project.as_deref()
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Zero means "use the transport's default".
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn request_reason(&self) -> Option<&str> {
        self.request_reason.as_deref()
    }

    pub fn base_paths(&self) -> &BasePaths {
        &self.base_paths
    }

    pub fn base_path(&self, service: &str) -> Result<&str> {
        self.base_paths.resolve(service)
    }

    pub fn user_project_override(&self) -> bool {
        self.user_project_override
    }

    pub fn batching(&self) -> BatchingConfig {
        self.batching
    }

    pub fn universe_domain(&self) -> Option<&str> {
        self.universe_domain.as_deref()
    }

    /// Value of the lower layer's quota project variable at activation time.
    pub fn quota_project_env(&self) -> Option<&str> {
        self.quota_project_env.as_deref()
    }

    pub fn default_labels(&self) -> &BTreeMap<String, String> {
        &self.default_labels
    }

    pub fn add_attribution_label(&self) -> bool {
        self.add_attribution_label
    }

    pub fn attribution_strategy(&self) -> AttributionStrategy {
        self.attribution_strategy
    }

    /// Labels to apply to a resource: defaults, then the resource's own
    /// labels, then the attribution label when enabled for this operation.
    pub fn effective_labels(
        &self,
        resource_labels: &BTreeMap<String, String>,
        creating: bool,
    ) -> BTreeMap<String, String> {
        let mut labels = self.default_labels.clone();
        labels.extend(resource_labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        let attribute = self.add_attribution_label
            && (creating || self.attribution_strategy == AttributionStrategy::Proactive);
        if attribute {
            labels.insert(ATTRIBUTION_LABEL_KEY.to_string(), ATTRIBUTION_LABEL_VALUE.to_string());
        }
        labels
    }

    /// A redacted, serializable view for display.
    pub fn report(&self) -> ConfigReport {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>".to_string());
        ConfigReport {
            credential_mode: self.credential_mode,
            access_token: redact(&self.access_token),
            credentials: redact(&self.credentials),
            impersonate_service_account: self.impersonate_service_account.clone(),
            impersonate_service_account_delegates: self.impersonate_service_account_delegates.clone(),
            project: self.project.clone(),
            region: self.region.clone(),
            zone: self.zone.clone(),
            billing_project: self.billing_project.clone(),
            scopes: self.scopes.clone(),
            user_project_override: self.user_project_override,
            request_reason: self.request_reason.clone(),
            request_timeout: format!("{}s", self.request_timeout.as_secs_f64()),
            user_agent: self.user_agent.clone(),
            mtls: self.base_paths.is_mtls(),
            batching: self.batching,
            default_labels: self.default_labels.clone(),
            terraform_attribution_label_addition_strategy: self.attribution_strategy,
            base_paths: self
                .base_paths
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

/// Serializable snapshot of a [`ResolvedConfig`] with secrets redacted.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigReport {
    pub credential_mode: CredentialMode,
    pub access_token: Option<String>,
    pub credentials: Option<String>,
    pub impersonate_service_account: Option<String>,
    pub impersonate_service_account_delegates: Vec<String>,
    pub project: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub billing_project: Option<String>,
    pub scopes: Vec<String>,
    pub user_project_override: bool,
    pub request_reason: Option<String>,
    pub request_timeout: String,
    pub user_agent: String,
    pub mtls: bool,
    pub batching: BatchingConfig,
    pub default_labels: BTreeMap<String, String>,
    pub terraform_attribution_label_addition_strategy: AttributionStrategy,
    pub base_paths: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::gcp::endpoints::StaticMtlsDetector;

    fn resolve_with(block: ProviderBlock, pairs: &[(&str, &str)]) -> Result<ResolvedConfig> {
        let env = Environment::from_pairs(pairs.iter().copied());
        ResolvedConfig::resolve(&block, &env, &StaticMtlsDetector(false))
    }

    #[test]
    fn test_defaults() {
        let config = resolve_with(ProviderBlock::default(), &[]).unwrap();
        assert_eq!(config.credential_mode(), CredentialMode::AmbientDefault);
        assert_eq!(config.credentials(), None);
        assert_eq!(config.scopes().len(), 2);
        assert_eq!(config.request_timeout(), Duration::ZERO);
        assert_eq!(config.batching(), BatchingConfig::default());
        assert!(!config.user_project_override());
        assert_eq!(config.attribution_strategy(), AttributionStrategy::CreationOnly);
        assert!(config.user_agent().starts_with("gcp-provider-core/"));
    }

    #[test]
    fn test_scenario_a_config_credentials_beat_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("my-path.json");
        std::fs::write(&path, "{}").unwrap();
        let creds = path.to_str().unwrap().to_string();
        let block = ProviderBlock {
            credentials: Some(creds.clone()),
            ..Default::default()
        };
        let config = resolve_with(block, &[("GOOGLE_CREDENTIALS", "other.json")]).unwrap();
        assert_eq!(config.credentials(), Some(creds.as_str()));
        assert_eq!(config.credential_mode(), CredentialMode::JsonCredentials);
    }

    #[test]
    fn test_scenario_b_project_from_second_env_var() {
        let config = resolve_with(
            ProviderBlock::default(),
            &[
                ("GOOGLE_PROJECT", ""),
                ("GOOGLE_CLOUD_PROJECT", "proj-2"),
                ("GCLOUD_PROJECT", "proj-3"),
            ],
        )
        .unwrap();
        assert_eq!(config.project(), Some("proj-2"));
    }

    #[test]
    fn test_scenario_d_empty_request_reason_uses_env() {
        let block = ProviderBlock {
            request_reason: Some(String::new()),
            ..Default::default()
        };
        let config =
            resolve_with(block, &[("CLOUDSDK_CORE_REQUEST_REASON", "env-reason")]).unwrap();
        assert_eq!(config.request_reason(), Some("env-reason"));
    }

    #[test]
    fn test_explicit_empty_project_is_rejected() {
        let block = ProviderBlock {
            project: Some(String::new()),
            ..Default::default()
        };
        let err = resolve_with(block, &[("GOOGLE_PROJECT", "p")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_explicit_empty_billing_project_is_rejected() {
        let block = ProviderBlock {
            billing_project: Some(String::new()),
            user_project_override: Some(BoolLike::Bool(true)),
            ..Default::default()
        };
        let err = resolve_with(block, &[("GOOGLE_BILLING_PROJECT", "env-billing")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("billing_project"));
    }

    #[test]
    fn test_token_and_credentials_conflict() {
        let block = ProviderBlock {
            access_token: Some("ya29.token".into()),
            credentials: Some(r#"{"type":"service_account"}"#.into()),
            ..Default::default()
        };
        let err = resolve_with(block, &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("access_token"));
    }

    #[test]
    fn test_credential_env_ignored_when_either_is_configured() {
        let block = ProviderBlock {
            access_token: Some("ya29.config".into()),
            ..Default::default()
        };
        let config = resolve_with(
            block,
            &[("GOOGLE_CREDENTIALS", r#"{"type":"service_account"}"#)],
        )
        .unwrap();
        assert_eq!(config.credential_mode(), CredentialMode::AccessToken);
        assert_eq!(config.credentials(), None);
    }

    #[test]
    fn test_env_access_token_outranks_env_credentials() {
        let config = resolve_with(
            ProviderBlock::default(),
            &[
                ("GOOGLE_OAUTH_ACCESS_TOKEN", "ya29.env"),
                ("GOOGLE_CREDENTIALS", r#"{"type":"service_account"}"#),
            ],
        )
        .unwrap();
        assert_eq!(config.credential_mode(), CredentialMode::AccessToken);
        assert_eq!(config.access_token(), Some("ya29.env"));
    }

    #[test]
    fn test_invalid_credentials_json() {
        let block = ProviderBlock {
            credentials: Some("{not json".into()),
            ..Default::default()
        };
        let err = resolve_with(block, &[]).unwrap_err();
        assert!(err.to_string().contains("JSON credentials are not valid"));
    }

    #[test]
    fn test_region_shortened_but_zone_kept() {
        let block = ProviderBlock {
            region: Some(
                "https://www.googleapis.com/compute/v1/projects/p/regions/us-central1".into(),
            ),
            zone: Some("https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-a".into()),
            ..Default::default()
        };
        let config = resolve_with(block, &[]).unwrap();
        assert_eq!(config.region(), Some("us-central1"));
        assert_eq!(
            config.zone(),
            Some("https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-a")
        );
    }

    #[test]
    fn test_user_project_override_forms() {
        for (raw, expected) in [
            (BoolLike::Bool(true), true),
            (BoolLike::Text("1".into()), true),
            (BoolLike::Text("false".into()), false),
        ] {
            let block = ProviderBlock {
                user_project_override: Some(raw),
                ..Default::default()
            };
            assert_eq!(resolve_with(block, &[]).unwrap().user_project_override(), expected);
        }
        let config = resolve_with(ProviderBlock::default(), &[("USER_PROJECT_OVERRIDE", "0")]).unwrap();
        assert!(!config.user_project_override());
        let config = resolve_with(ProviderBlock::default(), &[("USER_PROJECT_OVERRIDE", "true")]).unwrap();
        assert!(config.user_project_override());
        assert!(resolve_with(ProviderBlock::default(), &[("USER_PROJECT_OVERRIDE", "maybe")]).is_err());
    }

    #[test]
    fn test_batching_and_timeout_parsing() {
        let block = ProviderBlock {
            request_timeout: Some("45s".into()),
            batching: Some(BatchingBlock {
                send_after: Some("500ms".into()),
                enable_batching: Some(false),
            }),
            ..Default::default()
        };
        let config = resolve_with(block, &[]).unwrap();
        assert_eq!(config.request_timeout(), Duration::from_secs(45));
        assert_eq!(
            config.batching(),
            BatchingConfig {
                enabled: false,
                send_after: Duration::from_millis(500)
            }
        );

        let bad = ProviderBlock {
            batching: Some(BatchingBlock {
                send_after: Some("soon".into()),
                enable_batching: None,
            }),
            ..Default::default()
        };
        let err = resolve_with(bad, &[]).unwrap_err();
        assert!(err.to_string().contains("batching.send_after"));
    }

    #[test]
    fn test_user_agent_extension() {
        let config = resolve_with(
            ProviderBlock::default(),
            &[(USER_AGENT_EXTENSION_ENV, "my-wrapper/1.0")],
        )
        .unwrap();
        assert!(config.user_agent().ends_with(" my-wrapper/1.0"));
    }

    #[test]
    fn test_attribution_strategy() {
        let block = ProviderBlock {
            terraform_attribution_label_addition_strategy: Some("SOMETIMES".into()),
            ..Default::default()
        };
        let err = resolve_with(block, &[]).unwrap_err();
        assert!(err
            .to_string()
            .contains("unrecognized terraform_attribution_label_addition_strategy"));

        let block = ProviderBlock {
            add_terraform_attribution_label: Some(true),
            default_labels: Some(BTreeMap::from([("team".to_string(), "core".to_string())])),
            ..Default::default()
        };
        let config = resolve_with(block, &[]).unwrap();
        let created = config.effective_labels(&BTreeMap::new(), true);
        assert_eq!(created.get(ATTRIBUTION_LABEL_KEY).map(String::as_str), Some("true"));
        assert_eq!(created.get("team").map(String::as_str), Some("core"));
        let updated = config.effective_labels(&BTreeMap::new(), false);
        assert!(!updated.contains_key(ATTRIBUTION_LABEL_KEY));
    }

    #[test]
    fn test_mtls_and_overrides_flow_into_base_paths() {
        let mut block = ProviderBlock::default();
        block.set_custom_endpoint("storage_custom_endpoint", "https://storage.example/storage/v1/");
        let env = Environment::empty();
        let config = ResolvedConfig::resolve(&block, &env, &StaticMtlsDetector(true)).unwrap();
        assert_eq!(
            config.base_path("Compute").unwrap(),
            "https://compute.mtls.googleapis.com/compute/v1/"
        );
        assert_eq!(
            config.base_path("Storage").unwrap(),
            "https://storage.example/storage/v1/"
        );
    }

    #[test]
    fn test_report_redacts_secrets() {
        let block = ProviderBlock {
            access_token: Some("ya29.secret".into()),
            ..Default::default()
        };
        let report = resolve_with(block, &[]).unwrap().report();
        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains("ya29.secret"));
        assert!(json.contains("<redacted>"));
    }
}
