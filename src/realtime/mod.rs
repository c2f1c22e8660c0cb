//! Realtime channel.
//!
//! This module provides:
//! - The envelope wire format and client message set
//! - The connection lifecycle and reconnection policy
//! - A TCP server binding one connection to one session
//! - A reconnecting client

mod client;
mod connection;
mod envelope;
mod server;

pub use client::{ClientSession, RealtimeClient};
pub use connection::{Connection, ConnectionState, ReconnectPolicy};
pub use envelope::{
    ChunkPayload, ClientMessage, CompletePayload, Envelope, ErrorKind, ErrorPayload, EventType,
    HelloPayload, PhaseChangePayload, ProgressPayload, WorkflowUpdatePayload,
};
pub use server::{error_kind, RealtimeServer};
