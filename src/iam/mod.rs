//! IAM policy handling
//!
//! - [`policy`] - Wire types, the mergeable policy view and the writers
//! - [`store`] - Where policies are read from and written to
//! - [`manager`] - The optimistic read-merge-write loop

pub mod manager;
pub mod policy;
pub mod store;

pub use manager::{MutationOutcome, PolicyManager, PropagationCheck};
pub use policy::{normalize_member, AccessPolicyView, PolicyChange};
pub use store::{HttpPolicyStore, InMemoryPolicyStore, PolicyStore};
