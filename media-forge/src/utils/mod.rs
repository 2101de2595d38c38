//! Utility helpers.

pub mod fs;
pub mod keyed_lock;

pub use keyed_lock::KeyedLocks;
