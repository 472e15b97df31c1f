//! Host event streams.
//!
//! Host subsystems publish named events into an [`EventBus`]. Each running
//! plugin whose approved permissions name an event gets a forwarder task
//! that delivers it into the worker as a `hostEvent` command. The forwarder
//! lives inside a [`SubscriptionHandle`]; dropping the handle stops
//! delivery, so unsubscription needs no separate call.

use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Buffered events per stream before slow subscribers start lagging.
const EVENT_CAPACITY: usize = 32;

/// Named broadcast streams for host events.
///
/// The set of streams is fixed at construction; emitting to or subscribing
/// on a name outside the set is a no-op, never an error.
pub struct EventBus {
    channels: HashMap<String, broadcast::Sender<Value>>,
}

impl EventBus {
    /// Creates a bus with a fixed set of named streams.
    #[must_use]
    pub fn new(event_names: &[&str]) -> Self {
        let channels = event_names
            .iter()
            .map(|name| {
                let (tx, _) = broadcast::channel(EVENT_CAPACITY);
                ((*name).to_string(), tx)
            })
            .collect();
        Self { channels }
    }

    /// Whether the bus carries a stream with this name.
    #[must_use]
    pub fn contains(&self, event: &str) -> bool {
        self.channels.contains_key(event)
    }

    /// All stream names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    /// Publishes an event. Returns whether anyone was listening.
    pub fn emit(&self, event: &str, payload: Value) -> bool {
        match self.channels.get(event) {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    pub(crate) fn subscribe(&self, event: &str) -> Option<broadcast::Receiver<Value>> {
        self.channels.get(event).map(broadcast::Sender::subscribe)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(&[])
    }
}

/// One plugin's live subscription to one host event stream.
pub struct SubscriptionHandle {
    event: String,
    forwarder: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub(crate) fn new(event: String, forwarder: JoinHandle<()>) -> Self {
        Self { event, forwarder }
    }

    /// The event stream this subscription follows.
    #[must_use]
    pub fn event(&self) -> &str {
        &self.event
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}
