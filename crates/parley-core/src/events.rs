//! Session event bus
//!
//! The supervisor's reader and ticker threads publish here; the agent
//! service drains it to drive task completion and directory updates.

use crate::types::SessionStatus;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::time::Duration;

/// Events emitted by a session supervisor
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Raw output chunk from the wrapped process
    Output(Vec<u8>),

    /// Idle detection changed its verdict
    StatusChanged {
        from: SessionStatus,
        to: SessionStatus,
    },

    /// The wrapped process exited (or its PTY closed)
    Exited { code: Option<u32> },
}

/// Event bus using bounded crossbeam channels
///
/// Bounded channels provide backpressure - if the receiver is slow,
/// senders will block, preventing unbounded memory growth.
pub struct EventBus {
    tx: Sender<SessionEvent>,
    rx: Receiver<SessionEvent>,
}

impl EventBus {
    /// Create a new event bus with specified capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }

    /// Get a sender clone for spawning event producers
    pub fn sender(&self) -> Sender<SessionEvent> {
        self.tx.clone()
    }

    /// Get a receiver clone for a consumer thread
    pub fn receiver(&self) -> Receiver<SessionEvent> {
        self.rx.clone()
    }

    /// Receive the next event with timeout
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SessionEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Try to receive without blocking
    pub fn try_recv(&self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_bus() {
        let bus = EventBus::new(10);
        bus.sender()
            .send(SessionEvent::StatusChanged {
                from: SessionStatus::Processing,
                to: SessionStatus::Ready,
            })
            .unwrap();
        assert!(matches!(
            bus.try_recv(),
            Some(SessionEvent::StatusChanged {
                to: SessionStatus::Ready,
                ..
            })
        ));
        assert!(bus.try_recv().is_none());
    }
}
