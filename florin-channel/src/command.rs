//! Request/response correlation over one subchannel.
//!
//! The engine is the client half: it stamps each outbound command with a
//! per-worker monotonic id, parks the caller on a oneshot, and settles it
//! from the matching inbound response or a deadline. [`serve_commands`] is
//! the server half used by the worker agent and the background-api bridge.

use crate::error::{ChannelError, ChannelResult};
use crate::mux::{Subchannel, SubchannelReceiver, SubchannelSender};
use crate::protocol::{CommandMessage, CommandRequest, CommandResponse};
use async_trait::async_trait;
use florin_types::WorkerId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default deadline for a correlated command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(10_000);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, Value>>>>>;

/// Turns a fire-and-forget subchannel into request/response calls.
///
/// One engine per worker. Ids start at 0 and strictly increase; an id is
/// never reused within the worker's lifetime. Exactly one of resolve/reject
/// fires per id: whichever of response and deadline wins removes the pending
/// entry first, making the loser a no-op.
pub struct CommandEngine {
    worker_id: WorkerId,
    next_id: AtomicU64,
    pending: Pending,
    outbound: SubchannelSender,
    reader: JoinHandle<()>,
}

impl CommandEngine {
    /// Takes ownership of the command subchannel and starts the response
    /// reader.
    pub fn new(worker_id: WorkerId, subchannel: Subchannel) -> Self {
        let (outbound, receiver) = subchannel.split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(Self::read_responses(
            worker_id,
            receiver,
            Arc::clone(&pending),
        ));

        Self {
            worker_id,
            next_id: AtomicU64::new(0),
            pending,
            outbound,
            reader,
        }
    }

    /// The worker this engine is bound to.
    #[must_use]
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Sends `message` and awaits the correlated response.
    ///
    /// Resolves with the response's `result`, fails with its `error`, or
    /// fails with [`ChannelError::CommandTimeout`] if nothing arrives within
    /// `timeout` (default [`DEFAULT_COMMAND_TIMEOUT`]). A timed-out call
    /// frees its pending slot; a response arriving later is dropped by the
    /// reader as unrecognized.
    pub async fn command(
        &self,
        message: CommandMessage,
        timeout: Option<Duration>,
    ) -> ChannelResult<Value> {
        let timeout = timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let command = message.command.clone();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = CommandRequest { id, message };
        let payload = serde_json::to_value(&request)?;
        if let Err(e) = self.outbound.send(payload).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }
        debug!(worker_id = %self.worker_id, id, command = %command, "command sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(ChannelError::CommandFailed(error)),
            // Reader dropped the oneshot: the engine is being torn down.
            Ok(Err(_)) => Err(ChannelError::Closed(self.outbound.name().to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ChannelError::CommandTimeout {
                    worker_id: self.worker_id,
                    command,
                    id,
                })
            }
        }
    }

    /// Settles pending commands from inbound responses until the subchannel
    /// closes. Responses nobody is waiting for are logged and dropped.
    async fn read_responses(worker_id: WorkerId, mut receiver: SubchannelReceiver, pending: Pending) {
        while let Some(payload) = receiver.recv().await {
            let response: CommandResponse = match serde_json::from_value(payload) {
                Ok(response) => response,
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "dropping malformed command response");
                    continue;
                }
            };

            let Some(tx) = pending.lock().await.remove(&response.id) else {
                warn!(
                    worker_id = %worker_id,
                    id = response.id,
                    "dropping response with unrecognized command id"
                );
                continue;
            };

            // The caller may have timed out between removal and here; a
            // failed send is the no-op path.
            let _ = tx.send(response.into_outcome());
        }
        debug!(worker_id = %worker_id, "command subchannel closed");
    }
}

impl Drop for CommandEngine {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Handles inbound command requests on the server side of a subchannel.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Produces `Ok(result)` or `Err(error payload)` for one request.
    async fn handle_command(&self, command: &str, data: Value) -> Result<Value, Value>;
}

/// Serves inbound `{id, command, data}` requests until the subchannel
/// closes.
///
/// Requests are dispatched strictly in arrival order, one at a time, so the
/// per-subchannel ordering guarantee extends through the handler. Malformed
/// requests are logged and dropped (there is no id to answer on).
pub async fn serve_commands(subchannel: Subchannel, handler: Arc<dyn CommandHandler>) {
    let (sender, mut receiver) = subchannel.split();
    while let Some(payload) = receiver.recv().await {
        let request: CommandRequest = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(channel = %sender.name(), error = %e, "dropping malformed command request");
                continue;
            }
        };

        let response = match handler
            .handle_command(&request.message.command, request.message.data)
            .await
        {
            Ok(result) => CommandResponse::ok(request.id, result),
            Err(error) => CommandResponse::err(request.id, error),
        };

        let payload = match serde_json::to_value(&response) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = %sender.name(), error = %e, "failed to serialize command response");
                continue;
            }
        };
        if sender.send(payload).await.is_err() {
            break;
        }
    }
    debug!(channel = %sender.name(), "command serving stopped");
}
