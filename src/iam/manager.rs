//! Policy Concurrency Manager
//!
//! Runs each policy change through ReadCurrent, Merge and Write. A stale
//! etag sends the loop back to ReadCurrent after a jittered backoff; any
//! other error, or running out of attempts, ends it.
//!
//! Writers only touch their own slice of the policy (see
//! [`PolicyChange::apply_to`]), so a retry re-applies the same intent to
//! whatever another writer left behind. There is no in-process lock: writers
//! may live in other processes and the etag is the only arbiter. Within this
//! process a change for a resource whose cycle is already in flight is handed
//! to that cycle and merged after its next read, so local writers never race
//! each other for the etag.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::policy::{AccessPolicyView, PolicyChange};
use super::store::{HttpPolicyStore, PolicyStore};
use crate::config::BatchingConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::gcp::batcher::{BatchHandler, Queued, RequestBatcher};
use crate::gcp::client::GcpClient;
use crate::gcp::retry::{CallContext, RetryPolicy};

const OPERATION: &str = "setIamPolicy";

/// Result of one successful mutation.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    /// The policy as stored after the write (or as read, if nothing changed).
    pub policy: AccessPolicyView,
    /// Number of times the loop went back to ReadCurrent on a stale etag.
    pub conflict_retries: u32,
    /// False when the merge left the bindings unchanged and the write was skipped.
    pub written: bool,
}

/// Re-read a policy after writing it until the change shows up.
#[derive(Debug, Clone, PartialEq)]
pub struct PropagationCheck {
    /// Reads that must show the change.
    pub confirmations: u32,
    /// Wait before the first read; doubled after every read that misses.
    pub initial_wait: Duration,
    /// The check fails once the wait would exceed this.
    pub max_wait: Duration,
}

impl Default for PropagationCheck {
    fn default() -> Self {
        Self {
            confirmations: 3,
            initial_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(30),
        }
    }
}

pub struct PolicyManager<S: PolicyStore> {
    runner: CycleRunner<S>,
    batching: Option<BatchingConfig>,
    batcher: Option<RequestBatcher<PolicyBatchHandler<S>>>,
}

impl<S: PolicyStore> Clone for PolicyManager<S> {
    fn clone(&self) -> Self {
        Self {
            runner: self.runner.clone(),
            batching: self.batching,
            batcher: self.batcher.clone(),
        }
    }
}

impl<S: PolicyStore> PolicyManager<S> {
    pub fn new(store: S) -> Self {
        Self::from_arc(Arc::new(store))
    }

    pub fn from_arc(store: Arc<S>) -> Self {
        Self {
            runner: CycleRunner {
                store,
                retry: RetryPolicy::conflict_default(),
                propagation: None,
                inflight: Arc::new(InFlight::default()),
            },
            batching: None,
            batcher: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.runner.retry = retry;
        self.rebuild_batcher()
    }

    /// Confirm every write by re-reading before reporting success.
    pub fn with_propagation_check(mut self, check: PropagationCheck) -> Self {
        self.runner.propagation = Some(check);
        self.rebuild_batcher()
    }

    /// Coalesce changes to the same resource arriving within the window.
    pub fn with_batching(mut self, config: BatchingConfig) -> Self {
        self.batching = Some(config);
        self.rebuild_batcher()
    }

    fn rebuild_batcher(mut self) -> Self {
        self.batcher = self.batching.filter(|c| c.enabled).map(|config| {
            let handler = PolicyBatchHandler {
                runner: self.runner.clone(),
            };
            RequestBatcher::new("iam", handler, config)
        });
        self
    }

    pub fn store(&self) -> &S {
        &self.runner.store
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.runner.retry
    }

    pub async fn read(&self, resource: &str, ctx: &CallContext) -> Result<AccessPolicyView> {
        self.runner.store.get_policy(resource, ctx).await
    }

    /// Apply one change to the policy of `resource`.
    ///
    /// The change may share its read-merge-write cycle with other callers;
    /// it still succeeds or fails on its own.
    pub async fn mutate(
        &self,
        resource: &str,
        change: PolicyChange,
        ctx: &CallContext,
    ) -> Result<MutationOutcome> {
        match &self.batcher {
            Some(batcher) => batcher.enqueue(resource, change, ctx).await,
            None => {
                change.validate()?;
                self.runner
                    .submit(resource, vec![(change, ctx.clone())], ctx)
                    .await
            }
        }
    }

    /// Apply several changes, in order, within a single cycle.
    pub async fn mutate_all(
        &self,
        resource: &str,
        changes: &[PolicyChange],
        ctx: &CallContext,
    ) -> Result<MutationOutcome> {
        changes.iter().try_for_each(PolicyChange::validate)?;
        let unit = changes.iter().map(|c| (c.clone(), ctx.clone())).collect();
        self.runner.submit(resource, unit, ctx).await
    }
}

impl PolicyManager<HttpPolicyStore> {
    /// Manager for IAM policies served by `service`, batched per the
    /// client's configuration.
    pub fn for_service(client: GcpClient, service: &str) -> Result<Self> {
        let batching = client.config().batching();
        let store = HttpPolicyStore::for_service(client, service)?;
        Ok(Self::new(store).with_batching(batching))
    }
}

/// The read-merge-write loop for a fixed set of changes.
pub async fn read_modify_write<S: PolicyStore + ?Sized>(
    store: &S,
    retry: &RetryPolicy,
    resource: &str,
    changes: &[PolicyChange],
    ctx: &CallContext,
) -> Result<MutationOutcome> {
    run_cycle(store, retry, None, resource, ctx, || changes.to_vec()).await
}

/// The loop itself. `live` yields the changes to merge after each read, so
/// changes can join or leave between attempts.
async fn run_cycle<S, F>(
    store: &S,
    retry: &RetryPolicy,
    propagation: Option<&PropagationCheck>,
    resource: &str,
    ctx: &CallContext,
    mut live: F,
) -> Result<MutationOutcome>
where
    S: PolicyStore + ?Sized,
    F: FnMut() -> Vec<PolicyChange>,
{
    let mut backoff = retry.backoff.start();
    let mut attempts = 0;
    loop {
        ctx.check()?;
        attempts += 1;

        let current = store.get_policy(resource, ctx).await?;

        let changes = live();
        if changes.is_empty() {
            return Err(Error::Cancelled);
        }
        let merged = merge(&current, &changes);
        if merged.same_bindings(&current) {
            tracing::debug!("policy of {} already satisfies {} change(s)", resource, changes.len());
            return Ok(MutationOutcome {
                policy: current,
                conflict_retries: attempts - 1,
                written: false,
            });
        }

        match store.set_policy(resource, &merged, ctx).await {
            Ok(policy) => {
                tracing::debug!(
                    "wrote policy of {} after {} attempt(s), etag {:?}",
                    resource,
                    attempts,
                    policy.etag
                );
                if let Some(check) = propagation {
                    await_propagation(store, check, resource, &changes, ctx).await?;
                }
                return Ok(MutationOutcome {
                    policy,
                    conflict_retries: attempts - 1,
                    written: true,
                });
            }
            Err(err) if err.is_conflict() => {
                if !retry.allows_another(attempts) {
                    return Err(Error::Exhausted {
                        operation: OPERATION.to_string(),
                        target: resource.to_string(),
                        attempts,
                        source: Box::new(err),
                    });
                }
                let delay = backoff.next_delay();
                tracing::info!(
                    "policy of {} changed concurrently (etag {:?}), re-reading in {:?}",
                    resource,
                    merged.etag,
                    delay
                );
                ctx.sleep(delay).await?;
            }
            Err(err) => return Err(err),
        }
    }
}

fn merge(current: &AccessPolicyView, changes: &[PolicyChange]) -> AccessPolicyView {
    let mut merged = current.clone();
    for change in changes {
        change.apply_to(&mut merged);
    }
    merged
}

/// Wait until `confirmations` reads show `changes` already applied.
async fn await_propagation<S: PolicyStore + ?Sized>(
    store: &S,
    check: &PropagationCheck,
    resource: &str,
    changes: &[PolicyChange],
    ctx: &CallContext,
) -> Result<()> {
    let mut wait = check.initial_wait;
    let mut seen = 0;
    while seen < check.confirmations {
        if wait > check.max_wait {
            return Err(Error::NotPropagated(resource.to_string()));
        }
        ctx.sleep(wait).await?;
        match store.get_policy(resource, ctx).await {
            Ok(current) if merge(&current, changes).same_bindings(&current) => seen += 1,
            Ok(_) => {
                tracing::debug!("change to {} not visible yet, next read in {:?}", resource, wait * 2);
                wait *= 2;
            }
            // Reads are quota-limited; back off instead of failing.
            Err(err) if err.is_transient() => wait *= 2,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

// =========================================================================
// Cycles in flight
// =========================================================================

/// Changes that ride on one cycle, each with the caller that asked for it.
type Unit = Vec<(PolicyChange, CallContext)>;

struct Joined {
    unit: Unit,
    reply: oneshot::Sender<Result<MutationOutcome>>,
}

enum Slot {
    Lead,
    Wait(oneshot::Receiver<Result<MutationOutcome>>),
}

/// Resources with a cycle running in this process, and the changes waiting
/// to be merged into it.
#[derive(Default)]
struct InFlight {
    waiting: Mutex<HashMap<String, Vec<Joined>>>,
}

impl InFlight {
    fn waiting(&self) -> MutexGuard<'_, HashMap<String, Vec<Joined>>> {
        self.waiting.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim(&self, resource: &str, unit: &Unit) -> Slot {
        let mut waiting = self.waiting();
        match waiting.get_mut(resource) {
            Some(queue) => {
                let (reply, rx) = oneshot::channel();
                queue.push(Joined {
                    unit: unit.clone(),
                    reply,
                });
                Slot::Wait(rx)
            }
            None => {
                waiting.insert(resource.to_string(), Vec::new());
                Slot::Lead
            }
        }
    }

    fn drain(&self, resource: &str) -> Vec<Joined> {
        self.waiting()
            .get_mut(resource)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// End the cycle; changes that missed it go back to `claim`.
    fn release(&self, resource: &str) {
        let missed = self.waiting().remove(resource).unwrap_or_default();
        if !missed.is_empty() {
            tracing::debug!("{} change set(s) for {} missed the cycle", missed.len(), resource);
        }
    }
}

struct Leadership<'a> {
    inflight: &'a InFlight,
    resource: &'a str,
}

impl Drop for Leadership<'_> {
    fn drop(&mut self) {
        self.inflight.release(self.resource);
    }
}

/// Store, budgets, and the cycles this process has in flight.
struct CycleRunner<S: PolicyStore> {
    store: Arc<S>,
    retry: RetryPolicy,
    propagation: Option<PropagationCheck>,
    inflight: Arc<InFlight>,
}

impl<S: PolicyStore> Clone for CycleRunner<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            retry: self.retry.clone(),
            propagation: self.propagation.clone(),
            inflight: self.inflight.clone(),
        }
    }
}

impl<S: PolicyStore> CycleRunner<S> {
    /// Run `unit` in the cycle in flight on `resource`, or start one.
    async fn submit(&self, resource: &str, unit: Unit, ctx: &CallContext) -> Result<MutationOutcome> {
        loop {
            ctx.check()?;
            match self.inflight.claim(resource, &unit) {
                Slot::Wait(rx) => {
                    tracing::debug!("joining the cycle in flight on {}", resource);
                    if let Ok(outcome) = ctx.run(async { Ok::<_, Error>(rx.await) }).await? {
                        return outcome;
                    }
                }
                Slot::Lead => {
                    let _leadership = Leadership {
                        inflight: &*self.inflight,
                        resource,
                    };
                    return self.lead(resource, &unit, ctx).await;
                }
            }
        }
    }

    async fn lead(&self, resource: &str, unit: &Unit, ctx: &CallContext) -> Result<MutationOutcome> {
        let mut joined: Vec<Joined> = Vec::new();
        let result = run_cycle(
            self.store.as_ref(),
            &self.retry,
            self.propagation.as_ref(),
            resource,
            ctx,
            || {
                joined.extend(self.inflight.drain(resource));
                joined.retain(|j| !j.reply.is_closed());
                unit.iter()
                    .chain(joined.iter().flat_map(|j| j.unit.iter()))
                    .filter(|(_, caller)| caller.check().is_ok())
                    .map(|(change, _)| change.clone())
                    .collect()
            },
        )
        .await;

        match result {
            Ok(outcome) => {
                for j in joined {
                    let _ = j.reply.send(Ok(outcome.clone()));
                }
                Ok(outcome)
            }
            // Joined changes are dropped unanswered and claim a cycle again.
            Err(err) if err.kind() == ErrorKind::Cancelled => Err(err),
            Err(err) if joined.is_empty() => Err(err),
            Err(err) => {
                let shared = Arc::new(err);
                for j in joined {
                    let _ = j.reply.send(Err(Error::BatchFailed(shared.clone())));
                }
                Err(Error::BatchFailed(shared))
            }
        }
    }
}

// =========================================================================
// Batching
// =========================================================================

/// Merges every change queued for one resource into a single cycle.
///
/// Changes whose callers have given up are left out of the merge.
pub struct PolicyBatchHandler<S: PolicyStore> {
    runner: CycleRunner<S>,
}

#[async_trait]
impl<S: PolicyStore> BatchHandler for PolicyBatchHandler<S> {
    type Request = PolicyChange;
    type Response = MutationOutcome;

    async fn dispatch(
        &self,
        key: &str,
        requests: Vec<Queued<PolicyChange>>,
        ctx: &CallContext,
    ) -> Result<Vec<Result<MutationOutcome>>> {
        let mut outcomes: Vec<Option<Result<MutationOutcome>>> = Vec::with_capacity(requests.len());
        let mut accepted: Unit = Vec::new();
        for Queued { request, caller } in requests {
            match request.validate() {
                Ok(()) => {
                    outcomes.push(None);
                    accepted.push((request, caller));
                }
                Err(err) => outcomes.push(Some(Err(err))),
            }
        }

        if !accepted.is_empty() {
            tracing::debug!("merging {} change(s) to {} in one cycle", accepted.len(), key);
            let shared = self.runner.submit(key, accepted, ctx).await.map_err(|err| match err {
                Error::BatchFailed(inner) => inner,
                other => Arc::new(other),
            });
            for slot in outcomes.iter_mut().filter(|slot| slot.is_none()) {
                *slot = Some(match &shared {
                    Ok(outcome) => Ok(outcome.clone()),
                    Err(err) => Err(Error::BatchFailed(err.clone())),
                });
            }
        }

        Ok(outcomes
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(Error::Internal("change left without outcome".into()))))
            .collect())
    }
}
