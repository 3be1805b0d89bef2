//! Channel module - the duplex link both components sit on.
//!
//! The invoker and callee never talk to each other directly. They only
//! depend on the [`Channel`] capability:
//!
//! - `send` one structured value to the peer (fire-and-forget)
//! - `subscribe` to message and error events
//! - read and change the `connected` link state
//! - an optional `destroy` teardown hook
//!
//! Adapters:
//!
//! - [`MemoryChannel`] - in-process bus or linked pair
//! - [`StreamChannel`](crate::transport::StreamChannel) - framed MsgPack over any byte stream

mod memory;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;

pub use memory::MemoryChannel;

/// An event delivered to channel subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// One inbound value from the peer.
    Message(Value),
    /// A transport-level failure.
    Error(TransportError),
}

/// Receiving end of a channel subscription.
///
/// The stream ends when the channel is closed or destroyed.
pub type Subscription = mpsc::UnboundedReceiver<ChannelEvent>;

/// Transport contract consumed by [`Invoker`](crate::Invoker) and [`Callee`](crate::Callee).
pub trait Channel: Send + Sync + 'static {
    /// Transmit one value to the remote peer.
    fn send(&self, message: Value) -> Result<(), TransportError>;

    /// Start observing message and error events.
    ///
    /// Every subscriber sees every event emitted after it subscribed.
    fn subscribe(&self) -> Subscription;

    /// Current link state.
    fn is_connected(&self) -> bool;

    fn connect(&self);

    /// After this returns, `is_connected()` is false.
    fn disconnect(&self);

    /// Release listeners and resources.
    fn destroy(&self) {}
}

/// Fan-out of channel events to any number of subscribers.
///
/// Closed subscriptions are pruned on the next emit.
#[derive(Debug, Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ChannelEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver an event to every live subscriber.
    ///
    /// Returns the number of subscribers reached.
    pub fn emit(&self, event: ChannelEvent) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    /// Drop all subscribers, ending their streams.
    pub fn close(&self) {
        self.subscribers.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
