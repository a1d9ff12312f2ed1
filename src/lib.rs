//! Provider core for Google Cloud
//!
//! Turns a provider configuration block plus the process environment into an
//! immutable [`ResolvedConfig`], and supplies the machinery every resource
//! operation shares: credentials, endpoint resolution, quota routing, request
//! batching, the transport dispatcher and optimistic IAM policy updates.
//!
//! # Module Structure
//!
//! - [`config`] - Value resolution and the resolved configuration
//! - [`gcp`] - Authentication, endpoints, billing, batching and transport
//! - [`iam`] - Access policy model and the read-merge-write manager
//! - [`error`] - Error taxonomy shared by all of the above

pub mod config;
pub mod error;
pub mod gcp;
pub mod iam;

pub use config::{Environment, ProviderBlock, ResolvedConfig};
pub use error::{Error, ErrorKind, Result};
pub use gcp::client::GcpClient;
pub use gcp::retry::CallContext;
