//! WebSocket protocol layer.
//!
//! This module handles the frame codec, the opening handshake,
//! per-connection lifecycle events and the reactor that multiplexes
//! every connection on one thread.

mod connection;
mod event;
mod frame;
pub mod handshake;
mod manager;

pub use connection::{
    Connection, ConnectionEvent, ConnectionOptions, ConnectionState, HandshakeStatus, Incoming,
    ABNORMAL_CLOSURE,
};
pub use event::{EventEmitter, ListenerId};
pub use frame::{mask_payload, EncodeOptions, Frame, FrameSize, OpCode};
pub use manager::{ConnectionManager, ManagerEvent, Tick};
