//! Process-wide session admission lock.
//!
//! AirPlay-1 allows exactly one active playback session at a time. This
//! module is the single slot that SETUP/RECORD contend for: whoever holds
//! it owns the player, the RTP transport, and the three allocated UDP
//! ports (audio, control, timing). There is only ever zero or one holder —
//! modeled as `Mutex<Option<SlotHolder>>` rather than a map keyed by
//! session, since AirPlay-1 never has more than one active session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Result, RtspError};
use crate::session::connection::ConnectionState;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

const SERVER_PORT_MIN: u16 = 6000;
const SERVER_PORT_MAX: u16 = 65500;

/// Poll interval while waiting to preempt the current holder.
pub const PREEMPT_POLL: Duration = Duration::from_millis(100);
/// Total time budget given to a preemption attempt before giving up.
pub const PREEMPT_BUDGET: Duration = Duration::from_secs(3);

/// Allocate a globally unique connection number, used to identify the slot
/// holder and tag log lines for a connection's lifetime.
pub fn next_connection_number() -> u64 {
    CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// The three UDP ports a playing session owns.
#[derive(Debug, Clone, Copy)]
pub struct RtpPortTriple {
    pub audio: u16,
    pub control: u16,
    pub timing: u16,
}

/// Monotonic port allocator for the three RTP companion ports, reset to
/// its low watermark whenever the admission slot is acquired cleanly.
pub struct PortPool {
    next: AtomicU64,
}

impl PortPool {
    pub fn new() -> Self {
        Self { next: AtomicU64::new(SERVER_PORT_MIN as u64) }
    }

    fn allocate_one(&self) -> u16 {
        let port = self.next.fetch_add(1, Ordering::SeqCst);
        if port > SERVER_PORT_MAX as u64 {
            self.next.store(SERVER_PORT_MIN as u64 + 1, Ordering::SeqCst);
            return SERVER_PORT_MIN;
        }
        port as u16
    }

    pub fn allocate_triple(&self) -> RtpPortTriple {
        RtpPortTriple {
            audio: self.allocate_one(),
            control: self.allocate_one(),
            timing: self.allocate_one(),
        }
    }

    /// Reset the allocator to its starting watermark.
    pub fn reset(&self) {
        self.next.store(SERVER_PORT_MIN as u64, Ordering::SeqCst);
    }
}

impl Default for PortPool {
    fn default() -> Self {
        Self::new()
    }
}

struct SlotHolder {
    connection_number: u64,
    connection: Weak<ConnectionState>,
}

/// The single process-wide admission slot.
pub struct SessionAdmission {
    slot: Mutex<Option<SlotHolder>>,
    pub ports: PortPool,
}

impl SessionAdmission {
    pub fn new() -> Self {
        Self { slot: Mutex::new(None), ports: PortPool::new() }
    }

    /// Try to acquire the slot for `connection` without waiting. Resets the
    /// port pool to its low watermark on success.
    pub fn try_acquire(&self, connection: &Arc<ConnectionState>) -> Result<()> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Err(RtspError::SessionBusy);
        }
        *slot = Some(SlotHolder {
            connection_number: connection.connection_number,
            connection: Arc::downgrade(connection),
        });
        self.ports.reset();
        Ok(())
    }

    /// Release the slot if `connection_number` currently holds it. A
    /// mismatched release (the caller no longer owns the slot, e.g. it was
    /// preempted) is a no-op rather than an error.
    pub fn release(&self, connection_number: u64) {
        let mut slot = self.slot.lock();
        if matches!(slot.as_ref(), Some(holder) if holder.connection_number == connection_number) {
            *slot = None;
        }
    }

    /// Whether `connection_number` currently holds the slot.
    pub fn is_holder(&self, connection_number: u64) -> bool {
        matches!(self.slot.lock().as_ref(), Some(holder) if holder.connection_number == connection_number)
    }

    /// Whether the current holder (if any) is already `stop`-flagged, i.e.
    /// tearing down on its own rather than because this caller is
    /// preempting it.
    fn holder_is_stopping(&self) -> bool {
        let slot = self.slot.lock();
        match slot.as_ref().and_then(|holder| holder.connection.upgrade()) {
            Some(current) => current.stop.load(Ordering::Acquire),
            None => false,
        }
    }

    /// Ask the current holder (if any, and if it is not `connection_number`
    /// itself) to unwind, marking it `interrupting` so its own handlers can
    /// tell a requested stop apart from an error.
    fn signal_holder_to_stop(&self, connection_number: u64) {
        let slot = self.slot.lock();
        if let Some(holder) = slot.as_ref() {
            if holder.connection_number != connection_number {
                if let Some(current) = holder.connection.upgrade() {
                    current.interrupting.store(true, Ordering::Release);
                    current.stop.store(true, Ordering::Release);
                }
            }
        }
    }

    /// Attempt to acquire the slot, polling every [`PREEMPT_POLL`] until
    /// either it frees up or `deadline` passes. Used when
    /// `allow_session_interruption` is configured: the current holder is
    /// signalled to stop on entry and again on each failed poll, since its
    /// worker may not have observed the flag before the previous check.
    pub fn acquire_with_preempt(&self, connection: &Arc<ConnectionState>, deadline: Instant) -> Result<()> {
        loop {
            self.signal_holder_to_stop(connection.connection_number);
            match self.try_acquire(connection) {
                Ok(()) => return Ok(()),
                Err(RtspError::SessionBusy) => {
                    if Instant::now() >= deadline {
                        return Err(RtspError::SessionBusy);
                    }
                    std::thread::sleep(PREEMPT_POLL);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Try to acquire the slot, waiting (without signalling anyone to stop)
    /// only while the current holder is already `stop`-flagged on its own —
    /// it is tearing down and should clear shortly. A holder that is not
    /// `stop`-flagged fails immediately with no wait, since nothing here
    /// would make it let go. Used when `allow_session_interruption` is off,
    /// so a connection whose watchdog or TEARDOWN just fired doesn't cost
    /// the next ANNOUNCE a spurious `453` while it finishes unwinding.
    pub fn acquire_waiting_for_departing_holder(&self, connection: &Arc<ConnectionState>, deadline: Instant) -> Result<()> {
        loop {
            match self.try_acquire(connection) {
                Ok(()) => return Ok(()),
                Err(RtspError::SessionBusy) => {
                    if !self.holder_is_stopping() || Instant::now() >= deadline {
                        return Err(RtspError::SessionBusy);
                    }
                    std::thread::sleep(PREEMPT_POLL);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for SessionAdmission {
    fn default() -> Self {
        Self::new()
    }
}
