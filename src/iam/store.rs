//! Policy stores
//!
//! Where access policies are read from and written to. The store owns the
//! etag check: a write whose etag is stale must fail with a conflict so the
//! manager can re-read and re-merge.

use std::collections::HashMap;
#[cfg(test)]
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};

use super::policy::{AccessPolicyView, Policy, RoleBindings, IAM_POLICY_VERSION};
#[cfg(test)]
use super::policy::PolicyChange;
use crate::error::{ApiError, Result};
use crate::gcp::client::GcpClient;
use crate::gcp::retry::CallContext;

#[async_trait]
pub trait PolicyStore: Send + Sync + 'static {
    /// Current policy of `resource`, including its etag.
    async fn get_policy(&self, resource: &str, ctx: &CallContext) -> Result<AccessPolicyView>;

    /// Write `view` guarded by `view.etag`; returns the stored policy.
    async fn set_policy(
        &self,
        resource: &str,
        view: &AccessPolicyView,
        ctx: &CallContext,
    ) -> Result<AccessPolicyView>;
}

// =========================================================================
// HTTP store
// =========================================================================

/// `:getIamPolicy` / `:setIamPolicy` against one service's base path.
///
/// Resources are relative names such as `projects/my-project`.
#[derive(Clone)]
pub struct HttpPolicyStore {
    client: GcpClient,
    base_url: String,
    resource_project: Option<String>,
}

impl HttpPolicyStore {
    pub fn new(client: GcpClient, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            resource_project: None,
        }
    }

    /// Store rooted at the resolved base path of `service`.
    pub fn for_service(client: GcpClient, service: &str) -> Result<Self> {
        let base_url = client.config().base_path(service)?.to_string();
        Ok(Self::new(client, base_url))
    }

    /// Project whose quota is charged when the billing override is on.
    pub fn with_resource_project(mut self, project: impl Into<String>) -> Self {
        self.resource_project = Some(project.into());
        self
    }

    fn url(&self, resource: &str, method: &str) -> String {
        format!(
            "{}/{}:{}",
            self.base_url.trim_end_matches('/'),
            resource.trim_start_matches('/'),
            method
        )
    }
}

#[async_trait]
impl PolicyStore for HttpPolicyStore {
    async fn get_policy(&self, resource: &str, ctx: &CallContext) -> Result<AccessPolicyView> {
        let request = self
            .client
            .request(
                Method::POST,
                self.url(resource, "getIamPolicy"),
                self.resource_project.as_deref(),
            )
            .with_body(json!({ "options": { "requestedPolicyVersion": IAM_POLICY_VERSION } }))
            .with_operation("getIamPolicy", resource);
        let value = self.client.send(request, ctx).await?;
        Ok(AccessPolicyView::from_policy(decode_policy(value)?))
    }

    async fn set_policy(
        &self,
        resource: &str,
        view: &AccessPolicyView,
        ctx: &CallContext,
    ) -> Result<AccessPolicyView> {
        let request = self
            .client
            .request(
                Method::POST,
                self.url(resource, "setIamPolicy"),
                self.resource_project.as_deref(),
            )
            .with_body(json!({
                "policy": view.to_policy(),
                "updateMask": "bindings,etag,auditConfigs",
            }))
            .with_operation("setIamPolicy", resource);
        let value = self.client.send(request, ctx).await?;
        Ok(AccessPolicyView::from_policy(decode_policy(value)?))
    }
}

fn decode_policy(value: Value) -> Result<Policy> {
    if value.is_null() {
        return Ok(Policy::default());
    }
    Ok(serde_json::from_value(value)?)
}

// =========================================================================
// In-process store
// =========================================================================

#[derive(Default)]
struct MemoryState {
    policies: HashMap<String, AccessPolicyView>,
    revision: u64,
    #[cfg(test)]
    hooks: TestHooks,
}

impl MemoryState {
    fn next_etag(&mut self) -> String {
        self.revision += 1;
        format!("BwX{:08}", self.revision)
    }
}

/// A store kept in memory with real etag semantics.
#[derive(Default)]
pub struct InMemoryPolicyStore {
    state: Mutex<MemoryState>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, resource: impl Into<String>, bindings: RoleBindings) {
        let mut state = self.state();
        let etag = state.next_etag();
        state
            .policies
            .insert(resource.into(), AccessPolicyView::new(bindings, Some(etag)));
    }

    pub fn policy(&self, resource: &str) -> Option<AccessPolicyView> {
        self.state().policies.get(resource).cloned()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn get_policy(&self, resource: &str, ctx: &CallContext) -> Result<AccessPolicyView> {
        ctx.check()?;
        let mut state = self.state();
        if !state.policies.contains_key(resource) {
            let etag = state.next_etag();
            state
                .policies
                .insert(resource.to_string(), AccessPolicyView::new(RoleBindings::new(), Some(etag)));
        }
        let current = state
            .policies
            .get(resource)
            .cloned()
            .unwrap_or_default();
        #[cfg(test)]
        state.after_read(resource);
        Ok(current)
    }

    async fn set_policy(
        &self,
        resource: &str,
        view: &AccessPolicyView,
        ctx: &CallContext,
    ) -> Result<AccessPolicyView> {
        ctx.check()?;
        let mut state = self.state();
        let stored_etag = state.policies.get(resource).and_then(|p| p.etag.clone());
        if view.etag.is_some() && view.etag != stored_etag {
            #[cfg(test)]
            {
                state.hooks.conflicts += 1;
            }
            return Err(ApiError::from_response(
                409,
                r#"{"error":{"code":409,"message":"There were concurrent policy changes. Please retry the whole read-modify-write with exponential backoff.","status":"ABORTED"}}"#,
            )
            .into());
        }
        #[cfg(test)]
        {
            state.hooks.writes += 1;
        }
        let etag = state.next_etag();
        let mut stored = view.clone();
        stored.etag = Some(etag);
        state.policies.insert(resource.to_string(), stored.clone());
        Ok(stored)
    }
}

// =========================================================================
// Test hooks
// =========================================================================

/// Call counters and simulated writers from outside the process.
#[cfg(test)]
#[derive(Default)]
struct TestHooks {
    reads: usize,
    writes: usize,
    conflicts: usize,
    interference: HashMap<String, VecDeque<PolicyChange>>,
}

#[cfg(test)]
impl MemoryState {
    fn after_read(&mut self, resource: &str) {
        self.hooks.reads += 1;
        let pending = self
            .hooks
            .interference
            .get_mut(resource)
            .and_then(VecDeque::pop_front);
        if let Some(change) = pending {
            let etag = self.next_etag();
            if let Some(stored) = self.policies.get_mut(resource) {
                change.apply_to(stored);
                stored.etag = Some(etag);
            }
            tracing::debug!("concurrent writer modified {}", resource);
        }
    }
}

#[cfg(test)]
impl InMemoryPolicyStore {
    /// Apply `change` as another writer right after the next read of
    /// `resource`, making that reader's etag stale.
    pub(crate) fn interfere_after_next_read(&self, resource: impl Into<String>, change: PolicyChange) {
        self.state()
            .hooks
            .interference
            .entry(resource.into())
            .or_default()
            .push_back(change);
    }

    pub(crate) fn reads(&self) -> usize {
        self.state().hooks.reads
    }

    pub(crate) fn writes(&self) -> usize {
        self.state().hooks.writes
    }

    pub(crate) fn conflicts(&self) -> usize {
        self.state().hooks.conflicts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn bindings(role: &str, member: &str) -> RoleBindings {
        let mut map = RoleBindings::new();
        map.insert(role.to_string(), BTreeSet::from([member.to_string()]));
        map
    }

    #[tokio::test]
    async fn test_stale_etag_is_rejected() {
        let store = InMemoryPolicyStore::new();
        store.insert("projects/p", bindings("roles/viewer", "user:a@x.com"));
        let ctx = CallContext::new();

        let first = store.get_policy("projects/p", &ctx).await.unwrap();
        let second = store.get_policy("projects/p", &ctx).await.unwrap();
        let written = store.set_policy("projects/p", &first, &ctx).await.unwrap();
        assert_ne!(written.etag, first.etag);

        let err = store.set_policy("projects/p", &second, &ctx).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.conflicts(), 1);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_interference_bumps_etag_after_read() {
        let store = InMemoryPolicyStore::new();
        store.interfere_after_next_read(
            "projects/p",
            PolicyChange::AddMember {
                role: "roles/owner".into(),
                member: "user:z@x.com".into(),
            },
        );
        let ctx = CallContext::new();
        let read = store.get_policy("projects/p", &ctx).await.unwrap();
        assert!(read.bindings.is_empty());
        let stored = store.policy("projects/p").unwrap();
        assert_ne!(stored.etag, read.etag);
        assert!(stored.members("roles/owner").is_some());
    }
}
