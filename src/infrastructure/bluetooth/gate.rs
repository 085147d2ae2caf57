//! Connection Gate
//!
//! Guards the connect lifecycle: at most one attempt in flight, and a
//! connection state that only moves Idle -> Connecting -> Connected or back
//! to Idle through a transient Failed.

use crate::domain::models::ConnectionState;
use crate::infrastructure::bluetooth::lock;
use std::sync::Mutex;
use tracing::debug;

/// Identifies one accepted connect attempt. A reset invalidates every
/// ticket issued before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptTicket(u64);

#[derive(Debug)]
struct GateState {
    ready_to_connect: bool,
    state: ConnectionState,
    generation: u64,
}

#[derive(Debug)]
pub struct ConnectionGate {
    inner: Mutex<GateState>,
}

impl Default for ConnectionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionGate {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GateState {
                ready_to_connect: true,
                state: ConnectionState::Idle,
                generation: 0,
            }),
        }
    }

    pub fn is_ready_to_connect(&self) -> bool {
        lock(&self.inner).ready_to_connect
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Accepts a new attempt if none is in flight and nothing is connected.
    pub fn try_begin(&self) -> Option<AttemptTicket> {
        let mut gate = lock(&self.inner);
        if !gate.ready_to_connect || gate.state == ConnectionState::Connected {
            return None;
        }
        gate.ready_to_connect = false;
        gate.state = ConnectionState::Connecting;
        Some(AttemptTicket(gate.generation))
    }

    /// Marks the attempt connected and runs `publish` under the gate lock.
    ///
    /// Returns `None` without running `publish` if the ticket was
    /// invalidated by a reset.
    pub fn complete<T>(&self, ticket: AttemptTicket, publish: impl FnOnce() -> T) -> Option<T> {
        let mut gate = lock(&self.inner);
        if gate.generation != ticket.0 {
            return None;
        }
        let published = publish();
        gate.state = ConnectionState::Connected;
        gate.ready_to_connect = true;
        Some(published)
    }

    /// Records a failed attempt. Returns false for a stale ticket, which
    /// leaves the gate untouched.
    pub fn fail(&self, ticket: AttemptTicket) -> bool {
        let mut gate = lock(&self.inner);
        if gate.generation != ticket.0 {
            return false;
        }
        gate.state = ConnectionState::Failed;
        debug!("Connect attempt failed, returning gate to idle");
        gate.state = ConnectionState::Idle;
        gate.ready_to_connect = true;
        true
    }

    /// Forces the gate back to idle and invalidates outstanding tickets.
    pub fn reset(&self) {
        let mut gate = lock(&self.inner);
        gate.generation = gate.generation.wrapping_add(1);
        gate.state = ConnectionState::Idle;
        gate.ready_to_connect = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_attempt_in_flight() {
        let gate = ConnectionGate::new();
        let ticket = gate.try_begin();
        assert!(ticket.is_some());
        assert!(!gate.is_ready_to_connect());
        assert_eq!(gate.state(), ConnectionState::Connecting);
        assert!(gate.try_begin().is_none());
    }

    #[test]
    fn test_failure_reopens_gate() {
        let gate = ConnectionGate::new();
        let ticket = gate.try_begin().unwrap();
        assert!(gate.fail(ticket));
        assert!(gate.is_ready_to_connect());
        assert_eq!(gate.state(), ConnectionState::Idle);
        assert!(gate.try_begin().is_some());
    }

    #[test]
    fn test_connected_blocks_new_attempts() {
        let gate = ConnectionGate::new();
        let ticket = gate.try_begin().unwrap();
        assert_eq!(gate.complete(ticket, || 7), Some(7));
        assert!(gate.is_connected());
        assert!(gate.is_ready_to_connect());
        assert!(gate.try_begin().is_none());
    }

    #[test]
    fn test_reset_invalidates_ticket() {
        let gate = ConnectionGate::new();
        let ticket = gate.try_begin().unwrap();
        gate.reset();

        let mut published = false;
        assert_eq!(gate.complete(ticket, || published = true), None);
        assert!(!published);
        assert!(!gate.fail(ticket));
        assert_eq!(gate.state(), ConnectionState::Idle);
        assert!(gate.is_ready_to_connect());
    }
}
