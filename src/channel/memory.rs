//! In-process channels.
//!
//! - [`MemoryChannel::new`] - a shared bus: every `send` reaches every
//!   subscriber, the sender's own components included. The envelope
//!   `origin` tag is what keeps an invoker from treating its own requests
//!   as responses here.
//! - [`MemoryChannel::pair`] - two linked endpoints, like the two ends of a
//!   pipe or a `postMessage` bridge.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use super::{Channel, ChannelEvent, EventHub, Subscription};
use crate::error::TransportError;

/// A channel that never leaves the process.
#[derive(Debug)]
pub struct MemoryChannel {
    /// Where `send` delivers.
    outbound: Arc<EventHub>,
    /// What `subscribe` observes.
    inbound: Arc<EventHub>,
    connected: AtomicBool,
}

impl MemoryChannel {
    /// Create a shared bus.
    ///
    /// The bus starts disconnected; call `connect()` before invoking.
    pub fn new() -> Arc<Self> {
        let hub = Arc::new(EventHub::new());
        Arc::new(Self {
            outbound: hub.clone(),
            inbound: hub,
            connected: AtomicBool::new(false),
        })
    }

    /// Create two connected endpoints linked to each other.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a_to_b = Arc::new(EventHub::new());
        let b_to_a = Arc::new(EventHub::new());

        let a = Arc::new(Self {
            outbound: a_to_b.clone(),
            inbound: b_to_a.clone(),
            connected: AtomicBool::new(true),
        });
        let b = Arc::new(Self {
            outbound: b_to_a,
            inbound: a_to_b,
            connected: AtomicBool::new(true),
        });
        (a, b)
    }

    /// Inject a transport error to this endpoint's subscribers.
    pub fn emit_error(&self, error: TransportError) {
        self.inbound.emit(ChannelEvent::Error(error));
    }

    /// Number of live subscriptions on this endpoint.
    pub fn subscriber_count(&self) -> usize {
        self.inbound.subscriber_count()
    }
}

impl Channel for MemoryChannel {
    fn send(&self, message: Value) -> Result<(), TransportError> {
        self.outbound.emit(ChannelEvent::Message(message));
        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        self.inbound.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn connect(&self) {
        self.connected.store(true, Ordering::Release);
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    fn destroy(&self) {
        self.disconnect();
        self.inbound.close();
    }
}
