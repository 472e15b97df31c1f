//! Multiplexed duplex channels and command correlation for worker links.
//!
//! Every plugin worker talks to the host over exactly one duplex object
//! transport. This crate turns that single transport into the typed plumbing
//! the host and the worker agent both build on:
//!
//! - **Multiplexer**: splits one transport into independently ordered, named
//!   subchannels. Names are agreed ahead of time by both ends; there is no
//!   discovery handshake.
//! - **Command Engine**: request/response correlation over one subchannel.
//!   Requests carry a per-worker monotonic id; responses are matched back to
//!   their caller or dropped if nobody is waiting.
//! - **Command serving**: the mirror half — a sequential dispatch loop that
//!   answers `{id, command, data}` requests through a [`CommandHandler`].
//!
//! Subchannels share the transport's lifecycle: once the transport closes,
//! every subchannel derived from it closes, so no caller blocks forever on a
//! dead link.
//!
//! # Example
//!
//! ```
//! use florin_channel::{duplex_pair, Multiplexer};
//! use serde_json::json;
//!
//! tokio_test::block_on(async {
//!     let (host_end, worker_end) = duplex_pair();
//!     let host = Multiplexer::new(host_end, "demo");
//!     let worker = Multiplexer::new(worker_end, "demo-peer");
//!
//!     let host_cmd = host.subchannel("command").await.unwrap();
//!     let mut worker_cmd = worker.subchannel("command").await.unwrap();
//!
//!     host_cmd.send(json!({ "hello": "worker" })).await.unwrap();
//!     assert_eq!(worker_cmd.recv().await.unwrap()["hello"], "worker");
//! });
//! ```

mod command;
mod error;
mod mux;
mod protocol;

pub use command::{
    serve_commands, CommandEngine, CommandHandler, DEFAULT_COMMAND_TIMEOUT,
};
pub use error::{ChannelError, ChannelResult};
pub use mux::{
    duplex_pair, Duplex, Multiplexer, Subchannel, SubchannelReceiver, SubchannelSender,
};
pub use protocol::{CommandMessage, CommandRequest, CommandResponse, Frame};
