//! Duplex channel multiplexer.
//!
//! Splits one bidirectional object transport into independently ordered,
//! named subchannels. A single pump task routes inbound frames to the
//! subchannel registered under the frame's name; frames addressed to a name
//! nobody registered are logged and dropped. When the transport closes, the
//! pump clears the registry so every subchannel reader sees end-of-stream
//! instead of blocking forever.

use crate::error::{ChannelError, ChannelResult};
use crate::protocol::Frame;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Frames buffered per transport direction before senders wait.
const TRANSPORT_CAPACITY: usize = 64;

/// Messages buffered per subchannel before the pump waits.
const SUBCHANNEL_CAPACITY: usize = 64;

/// One end of an in-process duplex object transport.
#[derive(Debug)]
pub struct Duplex {
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
}

/// Creates a connected pair of transport ends (host side, worker side).
#[must_use]
pub fn duplex_pair() -> (Duplex, Duplex) {
    let (left_tx, right_rx) = mpsc::channel(TRANSPORT_CAPACITY);
    let (right_tx, left_rx) = mpsc::channel(TRANSPORT_CAPACITY);
    (
        Duplex {
            tx: left_tx,
            rx: left_rx,
        },
        Duplex {
            tx: right_tx,
            rx: right_rx,
        },
    )
}

type Registry = Arc<Mutex<HashMap<String, mpsc::Sender<Value>>>>;

/// Splits one transport end into named subchannels.
///
/// The `label` identifies the owning worker in log output; it has no wire
/// significance.
#[derive(Debug)]
pub struct Multiplexer {
    label: String,
    outbound: mpsc::Sender<Frame>,
    registry: Registry,
    pump: JoinHandle<()>,
}

impl Multiplexer {
    /// Wraps a transport end and starts the inbound pump.
    pub fn new(transport: Duplex, label: impl Into<String>) -> Self {
        let label = label.into();
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let pump = tokio::spawn(Self::pump_inbound(
            transport.rx,
            Arc::clone(&registry),
            label.clone(),
        ));

        Self {
            label,
            outbound: transport.tx,
            registry,
            pump,
        }
    }

    /// Wraps a transport end with every name in `names` registered before
    /// the pump starts, so no inbound frame can arrive ahead of its reader.
    ///
    /// Subchannels are returned in the order the names were given.
    pub fn with_subchannels(
        transport: Duplex,
        label: impl Into<String>,
        names: &[&str],
    ) -> ChannelResult<(Self, Vec<Subchannel>)> {
        let label = label.into();
        let mut table = HashMap::new();
        let mut subchannels = Vec::with_capacity(names.len());
        for name in names {
            let (tx, rx) = mpsc::channel(SUBCHANNEL_CAPACITY);
            if table.insert((*name).to_string(), tx).is_some() {
                return Err(ChannelError::DuplicateSubchannel((*name).to_string()));
            }
            subchannels.push(Subchannel {
                name: (*name).to_string(),
                outbound: transport.tx.clone(),
                inbound: rx,
            });
        }

        let registry: Registry = Arc::new(Mutex::new(table));
        let pump = tokio::spawn(Self::pump_inbound(
            transport.rx,
            Arc::clone(&registry),
            label.clone(),
        ));

        let mux = Self {
            label,
            outbound: transport.tx,
            registry,
            pump,
        };
        Ok((mux, subchannels))
    }

    /// Registers a named subchannel. Each name may be registered once.
    pub async fn subchannel(&self, name: &str) -> ChannelResult<Subchannel> {
        let (tx, rx) = mpsc::channel(SUBCHANNEL_CAPACITY);
        let mut registry = self.registry.lock().await;
        if registry.contains_key(name) {
            return Err(ChannelError::DuplicateSubchannel(name.to_string()));
        }
        registry.insert(name.to_string(), tx);

        Ok(Subchannel {
            name: name.to_string(),
            outbound: self.outbound.clone(),
            inbound: rx,
        })
    }

    /// Routes inbound frames to their subchannel until the transport closes.
    async fn pump_inbound(mut rx: mpsc::Receiver<Frame>, registry: Registry, label: String) {
        while let Some(frame) = rx.recv().await {
            let target = registry.lock().await.get(&frame.channel).cloned();
            match target {
                Some(tx) => {
                    if tx.send(frame.payload).await.is_err() {
                        debug!(
                            label = %label,
                            channel = %frame.channel,
                            "subchannel reader gone, dropping frame"
                        );
                    }
                }
                None => {
                    warn!(
                        label = %label,
                        channel = %frame.channel,
                        "orphaned frame for unregistered subchannel"
                    );
                }
            }
        }

        // Transport gone: drop every registered sender so readers see
        // end-of-stream rather than waiting on a dead link.
        warn!(label = %label, "transport closed, tearing down subchannels");
        registry.lock().await.clear();
    }

    /// The log label this multiplexer was created with.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Tears the multiplexer down: stops the pump and closes all
    /// subchannel read halves. Pending outbound frames are discarded.
    pub async fn shutdown(&self) {
        self.pump.abort();
        self.registry.lock().await.clear();
        debug!(label = %self.label, "multiplexer shut down");
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// One named, independently ordered stream over a shared transport.
#[derive(Debug)]
pub struct Subchannel {
    name: String,
    outbound: mpsc::Sender<Frame>,
    inbound: mpsc::Receiver<Value>,
}

impl Subchannel {
    /// The subchannel's wire name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writes one message to this subchannel.
    pub async fn send(&self, payload: Value) -> ChannelResult<()> {
        self.outbound
            .send(Frame::new(self.name.clone(), payload))
            .await
            .map_err(|_| ChannelError::Closed(self.name.clone()))
    }

    /// Reads the next message addressed to this subchannel.
    /// Returns `None` once the transport is closed.
    pub async fn recv(&mut self) -> Option<Value> {
        self.inbound.recv().await
    }

    /// Splits into independently owned send and receive halves.
    #[must_use]
    pub fn split(self) -> (SubchannelSender, SubchannelReceiver) {
        (
            SubchannelSender {
                name: self.name,
                outbound: self.outbound,
            },
            SubchannelReceiver {
                inbound: self.inbound,
            },
        )
    }
}

/// The send half of a split subchannel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SubchannelSender {
    name: String,
    outbound: mpsc::Sender<Frame>,
}

impl SubchannelSender {
    /// The subchannel's wire name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writes one message to this subchannel.
    pub async fn send(&self, payload: Value) -> ChannelResult<()> {
        self.outbound
            .send(Frame::new(self.name.clone(), payload))
            .await
            .map_err(|_| ChannelError::Closed(self.name.clone()))
    }
}

/// The receive half of a split subchannel.
#[derive(Debug)]
pub struct SubchannelReceiver {
    inbound: mpsc::Receiver<Value>,
}

impl SubchannelReceiver {
    /// Reads the next message addressed to this subchannel.
    /// Returns `None` once the transport is closed.
    pub async fn recv(&mut self) -> Option<Value> {
        self.inbound.recv().await
    }
}
