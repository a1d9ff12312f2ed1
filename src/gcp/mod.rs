//! GCP API interaction module
//!
//! Everything between a resolved provider configuration and the wire:
//! credentials, endpoints, quota routing, batching and the dispatcher.
//!
//! # Module Structure
//!
//! - [`auth`] - Credential selection, impersonation and token caching
//! - [`batcher`] - Debounced coalescing of batchable calls
//! - [`billing`] - Quota/billing project routing
//! - [`client`] - Per-activation client tying the pieces together
//! - [`endpoints`] - Service base paths, custom endpoints and mTLS
//! - [`http`] - Transport dispatcher with header injection and retries
//! - [`retry`] - Backoff, retry budgets and call cancellation
//!
//! # Example
//!
//! ```ignore
//! use gcp_provider_core::gcp::client::GcpClient;
//! use gcp_provider_core::gcp::retry::CallContext;
//!
//! async fn example(config: ResolvedConfig) -> gcp_provider_core::Result<()> {
//!     let client = GcpClient::new(config).await?;
//!     let url = client.compute_zonal_url("instances")?;
//!     let instances = client.get(&url, &CallContext::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod batcher;
pub mod billing;
pub mod client;
pub mod endpoints;
pub mod http;
pub mod retry;
