//! Stream-socket collaborator used by the websocket layer.
//!
//! # Data Flow
//! ```text
//! ConnectionManager::run_once
//!     → Transport::poll (only suspension point)
//!     → Transport::accept / read / write / close for ready handles
//! ```
//!
//! Handles are plain integer ids handed out by the transport; the socket
//! resources themselves never leave it.

mod memory;
mod socket;

pub use memory::MemoryTransport;
pub use socket::SocketTransport;

use std::cell::RefCell;
use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use crate::error::TransportError;

/// Opaque handle for one socket owned by a [`Transport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Operations the websocket layer needs from the environment.
///
/// Reads and accepts are expected to be called only for handles reported
/// ready by [`poll`](Transport::poll); a transport may still answer
/// [`TransportError::WouldBlock`] when there turned out to be nothing to do.
#[cfg_attr(test, mockall::automock)]
pub trait Transport {
    /// Creates an unbound stream socket.
    fn open(&mut self) -> Result<ConnectionId, TransportError>;

    fn bind(&mut self, handle: ConnectionId, address: &str, port: u16) -> Result<(), TransportError>;

    fn listen(&mut self, handle: ConnectionId) -> Result<(), TransportError>;

    fn connect(&mut self, handle: ConnectionId, address: &str, port: u16) -> Result<(), TransportError>;

    /// Next pending peer, or `None` when nobody is waiting.
    fn accept(&mut self, handle: ConnectionId) -> Result<Option<ConnectionId>, TransportError>;

    /// Up to `max` bytes. An empty vector means the peer closed its side.
    fn read(&mut self, handle: ConnectionId, max: usize) -> Result<Vec<u8>, TransportError>;

    /// Number of bytes accepted by the socket.
    fn write(&mut self, handle: ConnectionId, bytes: &[u8]) -> Result<usize, TransportError>;

    fn close(&mut self, handle: ConnectionId) -> Result<(), TransportError>;

    /// Subset of `handles` ready for reading, waiting at most `timeout`.
    fn poll(&mut self, handles: &[ConnectionId], timeout: Duration) -> Result<Vec<ConnectionId>, TransportError>;

    fn local_addr(&self, handle: ConnectionId) -> Result<SocketAddr, TransportError>;
}

/// Single-threaded shared access to one transport.
pub type SharedTransport = Rc<RefCell<dyn Transport>>;

pub fn shared<T: Transport + 'static>(transport: T) -> (Rc<RefCell<T>>, SharedTransport) {
    let concrete = Rc::new(RefCell::new(transport));
    let erased: SharedTransport = concrete.clone();
    (concrete, erased)
}
