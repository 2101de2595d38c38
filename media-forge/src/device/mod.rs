//! GPU device arbitration.

mod arbiter;
mod watchdog;

pub use arbiter::{AcquireRevoked, ArbiterEvent, DeviceArbiter, Lease, LeaseInfo, RevokeReason};
pub use watchdog::{LEASE_WATCHDOG_GRACE, LEASE_WATCHDOG_INTERVAL, LeaseWatchdog};
