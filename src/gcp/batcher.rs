//! Batching Coordinator
//!
//! Coalesces batchable calls that share a key and arrive within the debounce
//! window into one upstream operation. The first call for a key opens a batch
//! and starts its timer; when the timer fires the batch is handed to the
//! [`BatchHandler`] and each caller receives its own outcome.
//!
//! A caller that gives up before the timer fires is withdrawn from its batch.
//! Once every caller of a dispatched batch has gone, the batch's context is
//! cancelled.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use super::retry::CallContext;
use crate::config::BatchingConfig;
use crate::error::{Error, Result};

/// A request waiting in a batch, with the context of the caller behind it.
#[derive(Debug, Clone)]
pub struct Queued<R> {
    pub request: R,
    pub caller: CallContext,
}

/// Sends one coalesced batch upstream.
#[async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    /// Dispatch `requests` (in arrival order) as one operation.
    ///
    /// Must return exactly one outcome per request, in the same order. An
    /// `Err` means the whole batch failed and is reported to every caller.
    /// `ctx` is cancelled once no caller is waiting any more.
    async fn dispatch(
        &self,
        key: &str,
        requests: Vec<Queued<Self::Request>>,
        ctx: &CallContext,
    ) -> Result<Vec<Result<Self::Response>>>;
}

type Reply<H> = oneshot::Sender<Result<<H as BatchHandler>::Response>>;

struct Entry<H: BatchHandler> {
    id: Uuid,
    queued: Queued<H::Request>,
    reply: Reply<H>,
}

impl<H: BatchHandler> Entry<H> {
    fn is_live(&self) -> bool {
        !self.reply.is_closed() && self.queued.caller.check().is_ok()
    }
}

struct PendingBatch<H: BatchHandler> {
    id: Uuid,
    entries: Vec<Entry<H>>,
}

/// Debouncing batcher keyed by an arbitrary string (project, resource, ...).
pub struct RequestBatcher<H: BatchHandler> {
    name: String,
    handler: Arc<H>,
    config: BatchingConfig,
    pending: Arc<Mutex<HashMap<String, PendingBatch<H>>>>,
}

impl<H: BatchHandler> Clone for RequestBatcher<H> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            handler: self.handler.clone(),
            config: self.config,
            pending: self.pending.clone(),
        }
    }
}

impl<H: BatchHandler> RequestBatcher<H> {
    pub fn new(name: impl Into<String>, handler: H, config: BatchingConfig) -> Self {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> BatchingConfig {
        self.config
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Queue `request` under `key` and wait for its outcome.
    ///
    /// With batching disabled the request is dispatched on its own at once.
    pub async fn enqueue(
        &self,
        key: impl Into<String>,
        request: H::Request,
        ctx: &CallContext,
    ) -> Result<H::Response> {
        let key = key.into();
        ctx.check()?;
        let queued = Queued {
            request,
            caller: ctx.clone(),
        };

        if !self.config.enabled {
            let outcomes = ctx.run(self.handler.dispatch(&key, vec![queued], ctx)).await?;
            return single_outcome(outcomes);
        }

        let (tx, rx) = oneshot::channel();
        let entry_id = Uuid::new_v4();
        let entry = Entry {
            id: entry_id,
            queued,
            reply: tx,
        };
        let opened = {
            let mut pending = self.pending.lock().await;
            match pending.get_mut(&key) {
                Some(batch) => {
                    batch.entries.push(entry);
                    tracing::debug!(
                        "{} batch {} [{}] now holds {} request(s)",
                        self.name,
                        batch.id,
                        key,
                        batch.entries.len()
                    );
                    None
                }
                None => {
                    let id = Uuid::new_v4();
                    pending.insert(
                        key.clone(),
                        PendingBatch {
                            id,
                            entries: vec![entry],
                        },
                    );
                    Some(id)
                }
            }
        };

        if let Some(id) = opened {
            tracing::debug!(
                "{} batch {} [{}] opened, sending after {:?}",
                self.name,
                id,
                key,
                self.config.send_after
            );
            let this = self.clone();
            let batch_key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(this.config.send_after).await;
                this.flush(batch_key, id).await;
            });
        }

        let result = ctx
            .run(async {
                rx.await
                    .map_err(|_| Error::Internal(format!("{} batch for {} was dropped", self.name, key)))?
            })
            .await;
        if result.is_err() && ctx.check().is_err() {
            self.withdraw(&key, entry_id).await;
        }
        result
    }

    /// Take a cancelled caller's request out of its batch if not yet sent.
    async fn withdraw(&self, key: &str, entry_id: Uuid) {
        let mut pending = self.pending.lock().await;
        let Some(batch) = pending.get_mut(key) else {
            return;
        };
        let before = batch.entries.len();
        batch.entries.retain(|e| e.id != entry_id);
        if batch.entries.len() < before {
            tracing::debug!("{} batch {} [{}] dropped a cancelled request", self.name, batch.id, key);
        }
        if batch.entries.is_empty() {
            pending.remove(key);
        }
    }

    async fn flush(&self, key: String, id: Uuid) {
        let batch = {
            let mut pending = self.pending.lock().await;
            if pending.get(&key).is_some_and(|b| b.id == id) {
                pending.remove(&key)
            } else {
                None
            }
        };
        let Some(batch) = batch else {
            return;
        };

        let (live, gone): (Vec<_>, Vec<_>) = batch.entries.into_iter().partition(Entry::is_live);
        if !gone.is_empty() {
            tracing::debug!("{} batch {} [{}] skipping {} cancelled request(s)", self.name, id, key, gone.len());
        }
        if live.is_empty() {
            return;
        }

        let (requests, mut replies): (Vec<_>, Vec<_>) =
            live.into_iter().map(|e| (e.queued, e.reply)).unzip();
        let count = requests.len();
        tracing::debug!("{} batch {} [{}] sending {} request(s)", self.name, id, key, count);

        let ctx = CallContext::new();
        let result = {
            let dispatch = self.handler.dispatch(&key, requests, &ctx);
            tokio::pin!(dispatch);
            let abandoned = async {
                for reply in replies.iter_mut() {
                    reply.closed().await;
                }
            };
            tokio::pin!(abandoned);
            tokio::select! {
                result = &mut dispatch => result,
                _ = &mut abandoned => {
                    tracing::debug!("{} batch {} [{}] has no callers left, cancelling", self.name, id, key);
                    ctx.cancel();
                    dispatch.await
                }
            }
        };

        match result {
            Ok(outcomes) if outcomes.len() == count => {
                for (reply, outcome) in replies.into_iter().zip(outcomes) {
                    let _ = reply.send(outcome);
                }
            }
            Ok(outcomes) => {
                let err = Arc::new(Error::Internal(format!(
                    "{} batch returned {} outcome(s) for {} request(s)",
                    self.name,
                    outcomes.len(),
                    count
                )));
                for reply in replies {
                    let _ = reply.send(Err(Error::BatchFailed(err.clone())));
                }
            }
            Err(e) => {
                tracing::warn!("{} batch {} [{}] failed: {}", self.name, id, key, e);
                let err = Arc::new(e);
                for reply in replies {
                    let _ = reply.send(Err(Error::BatchFailed(err.clone())));
                }
            }
        }
    }
}

fn single_outcome<T>(mut outcomes: Vec<Result<T>>) -> Result<T> {
    match (outcomes.pop(), outcomes.is_empty()) {
        (Some(outcome), true) => outcome,
        _ => Err(Error::Internal("expected exactly one outcome".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ApiError, ErrorKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Doubles each number; odd inputs fail individually.
    #[derive(Default)]
    struct Doubler {
        batches: AtomicUsize,
        sizes: std::sync::Mutex<Vec<usize>>,
        fail_whole: bool,
    }

    #[async_trait]
    impl BatchHandler for Doubler {
        type Request = u32;
        type Response = u32;

        async fn dispatch(
            &self,
            _key: &str,
            requests: Vec<Queued<u32>>,
            _ctx: &CallContext,
        ) -> Result<Vec<Result<u32>>> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            self.sizes.lock().unwrap().push(requests.len());
            if self.fail_whole {
                return Err(Error::Api(ApiError::from_response(503, "")));
            }
            Ok(requests
                .into_iter()
                .map(|q| q.request)
                .map(|n| {
                    if n % 2 == 1 {
                        Err(Error::validation("n", "odd"))
                    } else {
                        Ok(n * 2)
                    }
                })
                .collect())
        }
    }

    fn config(enabled: bool) -> BatchingConfig {
        BatchingConfig {
            enabled,
            send_after: Duration::from_secs(3),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_within_window_coalesce() {
        let batcher = RequestBatcher::new("test", Doubler::default(), config(true));
        let ctx = CallContext::new();
        let (a, b, c) = tokio::join!(
            batcher.enqueue("k", 2, &ctx),
            batcher.enqueue("k", 4, &ctx),
            batcher.enqueue("k", 6, &ctx),
        );
        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (4, 8, 12));
        assert_eq!(batcher.handler.batches.load(Ordering::SeqCst), 1);
        assert_eq!(*batcher.handler.sizes.lock().unwrap(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_is_demultiplexed() {
        let batcher = RequestBatcher::new("test", Doubler::default(), config(true));
        let ctx = CallContext::new();
        let (ok, bad) = tokio::join!(batcher.enqueue("k", 2, &ctx), batcher.enqueue("k", 3, &ctx));
        assert_eq!(ok.unwrap(), 4);
        assert_eq!(bad.unwrap_err().kind(), ErrorKind::Validation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_whole_batch_failure_reaches_every_caller() {
        let handler = Doubler {
            fail_whole: true,
            ..Default::default()
        };
        let batcher = RequestBatcher::new("test", handler, config(true));
        let ctx = CallContext::new();
        let (a, b) = tokio::join!(batcher.enqueue("k", 2, &ctx), batcher.enqueue("k", 4, &ctx));
        for result in [a, b] {
            let err = result.unwrap_err();
            assert!(matches!(err, Error::BatchFailed(_)));
            assert!(err.is_transient());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_keys_do_not_coalesce() {
        let batcher = RequestBatcher::new("test", Doubler::default(), config(true));
        let ctx = CallContext::new();
        let (a, b) = tokio::join!(batcher.enqueue("k1", 2, &ctx), batcher.enqueue("k2", 4, &ctx));
        assert_eq!((a.unwrap(), b.unwrap()), (4, 8));
        assert_eq!(batcher.handler.batches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_bounded_by_window() {
        let batcher = RequestBatcher::new("test", Doubler::default(), config(true));
        let start = tokio::time::Instant::now();
        batcher.enqueue("k", 2, &CallContext::new()).await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(3));
        assert!(waited < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_disabled_dispatches_immediately() {
        let batcher = RequestBatcher::new("test", Doubler::default(), config(false));
        let ctx = CallContext::new();
        let start = std::time::Instant::now();
        assert_eq!(batcher.enqueue("k", 2, &ctx).await.unwrap(), 4);
        assert_eq!(batcher.enqueue("k", 4, &ctx).await.unwrap(), 8);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(batcher.handler.batches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_caller_unblocks() {
        let batcher = RequestBatcher::new("test", Doubler::default(), config(true));
        let ctx = CallContext::new();
        ctx.cancel();
        let err = batcher.enqueue("k", 2, &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_caller_is_withdrawn_before_send() {
        let batcher = RequestBatcher::new("test", Doubler::default(), config(true));
        let stays = CallContext::new();
        let leaves = CallContext::new();
        let canceller = leaves.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let (kept, left) = tokio::join!(
            batcher.enqueue("k", 2, &stays),
            batcher.enqueue("k", 4, &leaves),
        );
        assert_eq!(kept.unwrap(), 4);
        assert_eq!(left.unwrap_err().kind(), ErrorKind::Cancelled);
        assert_eq!(*batcher.handler().sizes.lock().unwrap(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_without_callers_is_never_sent() {
        let batcher = RequestBatcher::new("test", Doubler::default(), config(true));
        let ctx = CallContext::new().with_timeout(Duration::from_secs(1));
        let err = batcher.enqueue("k", 2, &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(batcher.handler().batches.load(Ordering::SeqCst), 0);
    }

    /// Waits on its context for a minute and records how that ended.
    #[derive(Default)]
    struct Stalling {
        ended: std::sync::Mutex<Option<ErrorKind>>,
    }

    #[async_trait]
    impl BatchHandler for Stalling {
        type Request = u32;
        type Response = u32;

        async fn dispatch(
            &self,
            _key: &str,
            requests: Vec<Queued<u32>>,
            ctx: &CallContext,
        ) -> Result<Vec<Result<u32>>> {
            let waited = ctx.sleep(Duration::from_secs(60)).await;
            *self.ended.lock().unwrap() = waited.as_ref().err().map(Error::kind);
            waited?;
            Ok(requests.into_iter().map(|q| Ok(q.request)).collect())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_is_cancelled_when_every_caller_leaves() {
        let batcher = RequestBatcher::new("test", Stalling::default(), config(true));
        let ctx = CallContext::new().with_timeout(Duration::from_secs(5));
        let err = batcher.enqueue("k", 2, &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*batcher.handler().ended.lock().unwrap(), Some(ErrorKind::Cancelled));
    }
}
