//! GCP Client
//!
//! Per-activation client combining the resolved configuration, the
//! authenticator and the dispatcher. Requests built here already carry the
//! base path for their service and the billing identity for their project.

use std::sync::Arc;

use reqwest::Method;
use serde_json::Value;

use super::auth::Authenticator;
use super::billing::billing_identity_for;
use super::http::{Dispatcher, OutgoingRequest};
use super::retry::CallContext;
use crate::config::ResolvedConfig;
use crate::error::{Error, Result};

/// Main GCP client
#[derive(Clone)]
pub struct GcpClient {
    config: Arc<ResolvedConfig>,
    auth: Authenticator,
    dispatcher: Dispatcher,
}

impl GcpClient {
    /// Activate the credential for `config` and build the dispatcher.
    pub async fn new(config: ResolvedConfig) -> Result<Self> {
        let dispatcher = Dispatcher::new(&config)?;
        let auth = Authenticator::from_config(&config, dispatcher.http_client()).await?;
        tracing::info!(
            "GCP client ready (credentials: {:?}, impersonating: {:?})",
            auth.mode(),
            auth.impersonated_account()
        );
        Ok(Self::from_parts(Arc::new(config), auth, dispatcher))
    }

    pub fn from_parts(config: Arc<ResolvedConfig>, auth: Authenticator, dispatcher: Dispatcher) -> Self {
        Self {
            config,
            auth,
            dispatcher,
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.auth
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The provider-level project, required by the URL helpers below.
    pub fn project(&self) -> Result<&str> {
        self.config
            .project()
            .ok_or_else(|| Error::validation("project", "no project configured"))
    }

    /// Build a request against `url` charged to `resource_project`.
    ///
    /// A resource without its own project falls back to the provider's.
    pub fn request(&self, method: Method, url: impl Into<String>, resource_project: Option<&str>) -> OutgoingRequest {
        let project = resource_project.or(self.config.project());
        OutgoingRequest::new(method, url).with_billing_project(billing_identity_for(&self.config, project))
    }

    pub async fn send(&self, request: OutgoingRequest, ctx: &CallContext) -> Result<Value> {
        self.dispatcher.send(&self.auth, request, ctx).await
    }

    /// Make a GET request to a GCP API
    pub async fn get(&self, url: &str, ctx: &CallContext) -> Result<Value> {
        self.send(self.request(Method::GET, url, None), ctx).await
    }

    /// Make a POST request to a GCP API
    pub async fn post(&self, url: &str, body: Option<Value>, ctx: &CallContext) -> Result<Value> {
        let mut request = self.request(Method::POST, url, None);
        request.body = body;
        self.send(request, ctx).await
    }

    /// Make a DELETE request to a GCP API
    pub async fn delete(&self, url: &str, ctx: &CallContext) -> Result<Value> {
        self.send(self.request(Method::DELETE, url, None), ctx).await
    }

    // =========================================================================
    // URL helpers
    // =========================================================================

    /// `path` joined onto the resolved base path of `service`.
    pub fn service_url(&self, service: &str, path: &str) -> Result<String> {
        let base = self.config.base_path(service)?;
        Ok(format!("{}{}", base, path.trim_start_matches('/')))
    }

    /// Build Compute Engine API URL
    pub fn compute_url(&self, path: &str) -> Result<String> {
        self.service_url("Compute", &format!("projects/{}/{}", self.project()?, path))
    }

    /// Build zonal Compute Engine API URL
    pub fn compute_zonal_url(&self, resource: &str) -> Result<String> {
        let zone = self
            .config
            .zone()
            .ok_or_else(|| Error::validation("zone", "no zone configured"))?;
        self.compute_url(&format!("zones/{}/{}", zone, resource))
    }

    /// Build regional Compute Engine API URL
    pub fn compute_regional_url(&self, resource: &str) -> Result<String> {
        let region = self
            .config
            .region()
            .ok_or_else(|| Error::validation("region", "no region configured"))?;
        self.compute_url(&format!("regions/{}/{}", region, resource))
    }

    /// Build global Compute Engine API URL
    pub fn compute_global_url(&self, resource: &str) -> Result<String> {
        self.compute_url(&format!("global/{}", resource))
    }

    /// Build Resource Manager API URL
    pub fn resourcemanager_url(&self, path: &str) -> Result<String> {
        self.service_url("ResourceManager", path)
    }
}
