//! Core type definitions for the Florin plugin platform.
//!
//! This crate defines the fundamental, host-agnostic identifier types shared
//! by the channel layer and the plugin host:
//! - Worker identifiers (UUID v7)
//!
//! Domain-specific types (plugin records, wire messages, capability tables)
//! belong to the crates that own them, not here.

mod ids;

pub use ids::WorkerId;
