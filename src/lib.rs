pub mod config;
pub mod error;
pub mod transport;
pub mod websocket;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
pub use config::Settings;

pub use transport::{ConnectionId, MemoryTransport, SharedTransport, SocketTransport, Transport};
pub use websocket::{Connection, ConnectionManager, EncodeOptions, Frame, OpCode};
