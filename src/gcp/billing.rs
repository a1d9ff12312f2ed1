//! Quota/Billing Router
//!
//! Decides which project's quota and billing a request is charged to, which
//! in turn determines the `X-Goog-User-Project` header.
//!
//! Layering note: the lower client layer honours `GOOGLE_CLOUD_QUOTA_PROJECT`
//! on its own. When that variable is present it wins over whatever the router
//! computed, even with `user_project_override` disabled. This is kept as-is;
//! the router customizes a default that the lower layer may override again.

use crate::config::ResolvedConfig;

/// Billing identity that suppresses the quota header for one request.
pub const NO_BILLING_PROJECT_OVERRIDE: &str = "NO_BILLING_PROJECT_OVERRIDE";

/// Project charged for a request, or `None` for the credential's default.
///
/// With the override flag off, `billing_project` is not consulted even when
/// set.
pub fn billing_identity(
    resource_project: Option<&str>,
    billing_project: Option<&str>,
    user_project_override: bool,
) -> Option<String> {
    if !user_project_override {
        return None;
    }
    billing_project
        .filter(|p| !p.is_empty())
        .or(resource_project.filter(|p| !p.is_empty()))
        .map(str::to_string)
}

/// Billing identity for a request against `resource_project` under `config`.
pub fn billing_identity_for(config: &ResolvedConfig, resource_project: Option<&str>) -> Option<String> {
    billing_identity(
        resource_project,
        config.billing_project(),
        config.user_project_override(),
    )
}

/// The quota project header actually sent.
///
/// `computed` is the router's decision for the request; `lower_layer` is the
/// value of `GOOGLE_CLOUD_QUOTA_PROJECT`, which replaces it when present.
pub fn quota_project_header(computed: Option<&str>, lower_layer: Option<&str>) -> Option<String> {
    if computed == Some(NO_BILLING_PROJECT_OVERRIDE) {
        return None;
    }
    if let Some(env_project) = lower_layer.filter(|p| !p.is_empty()) {
        if computed.is_some_and(|c| c != env_project) {
            tracing::debug!(
                "GOOGLE_CLOUD_QUOTA_PROJECT={} replaces computed quota project {:?}",
                env_project,
                computed
            );
        }
        return Some(env_project.to_string());
    }
    computed.filter(|c| !c.is_empty()).map(str::to_string)
}
