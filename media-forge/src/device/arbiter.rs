//! Exclusive access to the single GPU device.
//!
//! The device is modelled as one non-reentrant resource. Jobs call
//! [`DeviceArbiter::acquire`] and hold the returned [`Lease`] while GPU
//! stages run. Waiters are served by priority, then in arrival order.
//!
//! A lease is released when it is dropped, so a panicking or aborted holder
//! can never leak it. Releasing an already released or revoked lease is a
//! no-op.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::Priority;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Why a lease was revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RevokeReason {
    /// The holding job was cancelled.
    Cancelled,
    /// The holder overran its deadline and the watchdog reclaimed the device.
    Abandoned,
}

/// Arbiter lifecycle events, emitted in the order they take effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ArbiterEvent {
    Granted {
        lease_id: u64,
        job_id: String,
        priority: Priority,
        at: DateTime<Utc>,
    },
    Released {
        lease_id: u64,
        job_id: String,
        at: DateTime<Utc>,
    },
    Revoked {
        lease_id: u64,
        job_id: String,
        reason: RevokeReason,
        at: DateTime<Utc>,
    },
}

impl ArbiterEvent {
    pub fn lease_id(&self) -> u64 {
        match self {
            Self::Granted { lease_id, .. }
            | Self::Released { lease_id, .. }
            | Self::Revoked { lease_id, .. } => *lease_id,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            Self::Granted { job_id, .. }
            | Self::Released { job_id, .. }
            | Self::Revoked { job_id, .. } => job_id,
        }
    }
}

/// A pending `acquire` was revoked before the device was granted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("device acquisition for job {job_id} was revoked")]
pub struct AcquireRevoked {
    pub job_id: String,
}

/// Read-only view of the current holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseInfo {
    pub lease_id: u64,
    pub job_id: String,
    pub priority: Priority,
    pub acquired_at: DateTime<Utc>,
}

struct Holder {
    info: LeaseInfo,
    revoked: CancellationToken,
    deadline: Option<Instant>,
}

struct Grant {
    acquired_at: DateTime<Utc>,
    revoked: CancellationToken,
}

struct Waiter {
    lease_id: u64,
    job_id: String,
    priority: Priority,
    seq: u64,
    tx: oneshot::Sender<Grant>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // Max-heap: higher priority first, then lower sequence number (FIFO).
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct State {
    holder: Option<Holder>,
    waiters: BinaryHeap<Waiter>,
    seq: u64,
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<ArbiterEvent>,
    next_lease_id: AtomicU64,
}

/// Serialises access to the GPU device.
#[derive(Clone)]
pub struct DeviceArbiter {
    inner: Arc<Inner>,
}

impl Default for DeviceArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceArbiter {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                events,
                next_lease_id: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to lease events.
    pub fn subscribe(&self) -> broadcast::Receiver<ArbiterEvent> {
        self.inner.events.subscribe()
    }

    /// Wait for exclusive device access.
    ///
    /// Fails only if [`try_cancel`](Self::try_cancel) revokes the request
    /// while it is still queued. Dropping the returned future gives up the
    /// place in the queue, or the device if it was granted in the meantime.
    pub async fn acquire(&self, job_id: &str, priority: Priority) -> Result<Lease, AcquireRevoked> {
        let lease_id = self.inner.next_lease_id.fetch_add(1, Ordering::Relaxed);

        let rx = {
            let mut state = self.inner.state.lock();
            if state.holder.is_none() && state.waiters.is_empty() {
                let grant = self.grant_locked(&mut state, lease_id, job_id, priority);
                return Ok(self.lease_from_grant(lease_id, job_id, priority, grant));
            }

            let (tx, rx) = oneshot::channel();
            state.seq += 1;
            let seq = state.seq;
            state.waiters.push(Waiter {
                lease_id,
                job_id: job_id.to_string(),
                priority,
                seq,
                tx,
            });
            debug!(
                job_id = %job_id,
                lease_id,
                %priority,
                waiting = state.waiters.len(),
                "Waiting for device"
            );
            rx
        };

        let mut pending = PendingAcquire {
            arbiter: self,
            lease_id,
            settled: false,
        };
        let result = rx.await;
        pending.settled = true;

        match result {
            Ok(grant) => Ok(self.lease_from_grant(lease_id, job_id, priority, grant)),
            Err(_) => Err(AcquireRevoked {
                job_id: job_id.to_string(),
            }),
        }
    }

    /// Release a lease. Equivalent to dropping it.
    pub fn release(&self, lease: Lease) {
        drop(lease);
    }

    /// Revoke every pending or held lease of `job_id`.
    ///
    /// Queued `acquire` calls for the job fail with [`AcquireRevoked`]; a
    /// held lease has its revocation token cancelled and the device passes
    /// to the next waiter immediately. Returns `true` if anything was revoked.
    pub fn try_cancel(&self, job_id: &str) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.waiters.len();
        // Dropping a waiter's sender fails its pending `acquire`.
        state.waiters.retain(|w| w.job_id != job_id);
        let mut revoked = state.waiters.len() != before;

        if state
            .holder
            .as_ref()
            .is_some_and(|h| h.info.job_id == job_id)
        {
            self.revoke_holder_locked(&mut state, RevokeReason::Cancelled);
            revoked = true;
        }
        revoked
    }

    /// Arm or clear the deadline of the lease `lease_id`.
    fn set_deadline(&self, lease_id: u64, timeout: Option<Duration>) {
        let mut state = self.inner.state.lock();
        if let Some(holder) = state.holder.as_mut()
            && holder.info.lease_id == lease_id
        {
            holder.deadline = timeout.map(|t| Instant::now() + t);
        }
    }

    /// Reclaim the device if the holder is past its deadline plus `grace`.
    ///
    /// Returns the reclaimed lease.
    pub fn reclaim_expired(&self, grace: Duration) -> Option<LeaseInfo> {
        let mut state = self.inner.state.lock();
        let expired = state
            .holder
            .as_ref()
            .and_then(|h| h.deadline)
            .is_some_and(|deadline| Instant::now() >= deadline + grace);
        if !expired {
            return None;
        }
        let info = state.holder.as_ref().map(|h| h.info.clone());
        if let Some(info) = &info {
            warn!(
                job_id = %info.job_id,
                lease_id = info.lease_id,
                "Reclaiming abandoned device lease"
            );
        }
        self.revoke_holder_locked(&mut state, RevokeReason::Abandoned);
        info
    }

    /// Current holder, if any.
    pub fn holder(&self) -> Option<LeaseInfo> {
        self.inner.state.lock().holder.as_ref().map(|h| h.info.clone())
    }

    /// Number of queued `acquire` calls.
    pub fn waiting(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    fn lease_from_grant(
        &self,
        lease_id: u64,
        job_id: &str,
        priority: Priority,
        grant: Grant,
    ) -> Lease {
        Lease {
            arbiter: self.clone(),
            info: LeaseInfo {
                lease_id,
                job_id: job_id.to_string(),
                priority,
                acquired_at: grant.acquired_at,
            },
            revoked: grant.revoked,
        }
    }

    fn grant_locked(
        &self,
        state: &mut State,
        lease_id: u64,
        job_id: &str,
        priority: Priority,
    ) -> Grant {
        let acquired_at = Utc::now();
        let revoked = CancellationToken::new();
        state.holder = Some(Holder {
            info: LeaseInfo {
                lease_id,
                job_id: job_id.to_string(),
                priority,
                acquired_at,
            },
            revoked: revoked.clone(),
            deadline: None,
        });
        self.emit(ArbiterEvent::Granted {
            lease_id,
            job_id: job_id.to_string(),
            priority,
            at: acquired_at,
        });
        Grant {
            acquired_at,
            revoked,
        }
    }

    /// Hand the device to the best waiter that is still listening.
    fn grant_next_locked(&self, state: &mut State) {
        while let Some(waiter) = state.waiters.pop() {
            if waiter.tx.is_closed() {
                continue;
            }
            let grant = self.grant_locked(state, waiter.lease_id, &waiter.job_id, waiter.priority);
            if waiter.tx.send(grant).is_ok() {
                return;
            }
            // Receiver went away between the check and the send.
            self.clear_holder_locked(state);
        }
    }

    fn clear_holder_locked(&self, state: &mut State) {
        if let Some(holder) = state.holder.take() {
            self.emit(ArbiterEvent::Released {
                lease_id: holder.info.lease_id,
                job_id: holder.info.job_id,
                at: Utc::now(),
            });
        }
    }

    fn revoke_holder_locked(&self, state: &mut State, reason: RevokeReason) {
        if let Some(holder) = state.holder.take() {
            holder.revoked.cancel();
            info!(
                job_id = %holder.info.job_id,
                lease_id = holder.info.lease_id,
                %reason,
                "Device lease revoked"
            );
            self.emit(ArbiterEvent::Revoked {
                lease_id: holder.info.lease_id,
                job_id: holder.info.job_id,
                reason,
                at: Utc::now(),
            });
        }
        self.grant_next_locked(state);
    }

    fn release_id(&self, lease_id: u64) {
        let mut state = self.inner.state.lock();
        if state
            .holder
            .as_ref()
            .is_some_and(|h| h.info.lease_id == lease_id)
        {
            self.clear_holder_locked(&mut state);
            self.grant_next_locked(&mut state);
        }
    }

    /// Drop a queued request, or the device if it was granted but never
    /// picked up.
    fn abandon_pending(&self, lease_id: u64) {
        let mut state = self.inner.state.lock();
        state.waiters.retain(|w| w.lease_id != lease_id);
        if state
            .holder
            .as_ref()
            .is_some_and(|h| h.info.lease_id == lease_id)
        {
            self.clear_holder_locked(&mut state);
            self.grant_next_locked(&mut state);
        }
    }

    fn emit(&self, event: ArbiterEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

/// Cleans up after an `acquire` future dropped before it settled.
struct PendingAcquire<'a> {
    arbiter: &'a DeviceArbiter,
    lease_id: u64,
    settled: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.arbiter.abandon_pending(self.lease_id);
        }
    }
}

/// Exclusive ownership of the GPU device. Released on drop.
pub struct Lease {
    arbiter: DeviceArbiter,
    info: LeaseInfo,
    revoked: CancellationToken,
}

impl Lease {
    pub fn id(&self) -> u64 {
        self.info.lease_id
    }

    pub fn job_id(&self) -> &str {
        &self.info.job_id
    }

    pub fn priority(&self) -> Priority {
        self.info.priority
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.info.acquired_at
    }

    /// Cancelled when the arbiter revokes this lease.
    pub fn revoked(&self) -> CancellationToken {
        self.revoked.clone()
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.is_cancelled()
    }

    /// Arm a deadline for the watchdog; `None` disarms it.
    pub fn set_deadline(&self, timeout: Option<Duration>) {
        self.arbiter.set_deadline(self.info.lease_id, timeout);
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("info", &self.info)
            .field("revoked", &self.revoked.is_cancelled())
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.arbiter.release_id(self.info.lease_id);
    }
}
