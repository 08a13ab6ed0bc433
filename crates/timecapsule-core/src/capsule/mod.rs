//! Capsule records and their encrypted store.

mod model;
mod store;

pub use model::{Capsule, CapsuleStatus, CapsuleSummary, JobId};
pub use store::{CapsuleIter, CapsuleStore};
