//! Audit event channel
//!
//! The core emits one structured event per state transition, capability
//! invocation, spawn rejection, and run completion. Delivery is
//! fire-and-forget over an unbounded channel: a slow or absent consumer
//! never blocks orchestration.

use tokio::sync::mpsc;

use crate::protocol::Event;

/// Consumer side of the orchestrator's audit event stream
pub struct AuditChannel {
    event_rx: mpsc::UnboundedReceiver<Event>,
}

impl AuditChannel {
    /// Create the channel pair
    ///
    /// Returns the consumer handle and the sender the orchestrator emits
    /// into.
    pub(crate) fn new() -> (Self, mpsc::UnboundedSender<Event>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (Self { event_rx }, event_tx)
    }

    /// Receive the next event, waiting if none is pending
    ///
    /// Returns `None` once the orchestrator has been dropped and all
    /// buffered events were consumed.
    pub async fn recv(&mut self) -> Option<Event> {
        self.event_rx.recv().await
    }

    /// Receive an event without waiting
    pub fn try_recv(&mut self) -> Option<Event> {
        self.event_rx.try_recv().ok()
    }

    /// Drain every buffered event
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}
