#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Rheovoice
//! Rheovoice is an audio-only WebRTC SFU. Every participant of a room publishes one Opus stream over a single connection and receives the streams of everybody else on the same connection.
//! Packets are forwarded without transcoding, and packets lost between the server and a client are recovered with NACK based retransmission.
//!
//! ## Usage
//! Run the `rheovoice` binary with a TOML configuration, or build an [`engine::Engine`] and serve it with [`rpc::serve`].

/// Configuration for [`engine::Engine`] and [`peer::Peer`].
pub mod config;
/// Engine owns the rooms and the connector for one process.
pub mod engine;
pub mod error;
/// Peer is one participant's session and its relay tasks.
pub mod peer;
/// Relay buffer, loss detection and fan-out to subscribers.
pub mod relay;
/// Registry of the peers in every room.
pub mod room;
/// Publish, trickle, subscribe and answer against the rooms of an engine.
pub mod router;
/// JSON RPC server.
pub mod rpc;
/// Parsing and validation of client supplied signaling data.
pub mod signaling;
/// Connection abstraction and its WebRTC implementation.
pub mod transport;
/// TURN credentials.
pub mod turn;
