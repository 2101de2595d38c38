//! Durable job store.
//!
//! The store is the only owner of job records. Updates are serialised per
//! job id and applied as compare-and-swap writes so that a concurrent writer
//! in another process can never be silently overwritten.

mod filter;
mod job_store;

pub use filter::JobFilter;
pub use job_store::{JobStore, ReconcileSummary};
