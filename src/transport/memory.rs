use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use super::{ConnectionId, Transport};
use crate::error::TransportError;

#[derive(Debug)]
enum Slot {
    Unbound,
    Bound { port: u16 },
    Listening { port: u16, pending: VecDeque<ConnectionId> },
    Stream(Stream),
    /// Bytes written before the close, kept for inspection.
    Closed(Vec<u8>),
}

#[derive(Debug, Default)]
struct Stream {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    hung_up: bool,
    write_limit: Option<usize>,
    read_error: Option<io::ErrorKind>,
}

/// Deterministic in-process transport.
///
/// Peers are scripted from the outside: queue them on a listener with
/// [`push_peer`](Self::push_peer), feed their bytes with [`feed`](Self::feed)
/// and inspect what the server wrote with [`take_written`](Self::take_written).
/// `poll` never sleeps.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    slots: HashMap<ConnectionId, Slot>,
    next_id: u64,
    polls: usize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a new peer on `listener` and returns the handle it will get on accept.
    pub fn push_peer(&mut self, listener: ConnectionId) -> Result<ConnectionId, TransportError> {
        let peer = self.allocate(Slot::Stream(Stream::default()));
        match self.slots.get_mut(&listener) {
            Some(Slot::Listening { pending, .. }) => {
                pending.push_back(peer);
                Ok(peer)
            }
            _ => {
                self.slots.remove(&peer);
                Err(TransportError::InvalidState(format!("{} is not listening", listener)))
            }
        }
    }

    /// Appends bytes to what the peer behind `handle` has sent.
    pub fn feed(&mut self, handle: ConnectionId, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream_mut(handle)?.inbound.extend(bytes);
        Ok(())
    }

    /// Simulates the peer closing its side; reads drain then return EOF.
    pub fn hang_up(&mut self, handle: ConnectionId) -> Result<(), TransportError> {
        self.stream_mut(handle)?.hung_up = true;
        Ok(())
    }

    /// Caps how many bytes each write accepts.
    pub fn limit_writes(&mut self, handle: ConnectionId, limit: Option<usize>) -> Result<(), TransportError> {
        self.stream_mut(handle)?.write_limit = limit;
        Ok(())
    }

    /// Makes the next read on `handle` fail with `kind`.
    pub fn fail_next_read(&mut self, handle: ConnectionId, kind: io::ErrorKind) -> Result<(), TransportError> {
        self.stream_mut(handle)?.read_error = Some(kind);
        Ok(())
    }

    /// Drains everything written to `handle` so far. Works on closed handles too.
    pub fn take_written(&mut self, handle: ConnectionId) -> Vec<u8> {
        match self.slots.get_mut(&handle) {
            Some(Slot::Stream(stream)) => std::mem::take(&mut stream.outbound),
            Some(Slot::Closed(transcript)) => std::mem::take(transcript),
            _ => Vec::new(),
        }
    }

    pub fn is_closed(&self, handle: ConnectionId) -> bool {
        matches!(self.slots.get(&handle), Some(Slot::Closed(_)))
    }

    pub fn poll_count(&self) -> usize {
        self.polls
    }

    fn allocate(&mut self, slot: Slot) -> ConnectionId {
        self.next_id += 1;
        let id = ConnectionId::new(self.next_id);
        self.slots.insert(id, slot);
        id
    }

    fn slot_mut(&mut self, handle: ConnectionId) -> Result<&mut Slot, TransportError> {
        self.slots
            .get_mut(&handle)
            .ok_or(TransportError::UnknownHandle(handle.as_u64()))
    }

    fn stream_mut(&mut self, handle: ConnectionId) -> Result<&mut Stream, TransportError> {
        match self.slot_mut(handle)? {
            Slot::Stream(stream) => Ok(stream),
            other => Err(TransportError::InvalidState(format!("{} is {:?}", handle, other))),
        }
    }

    fn is_ready(&self, handle: &ConnectionId) -> bool {
        match self.slots.get(handle) {
            Some(Slot::Listening { pending, .. }) => !pending.is_empty(),
            Some(Slot::Stream(stream)) => {
                !stream.inbound.is_empty() || stream.hung_up || stream.read_error.is_some()
            }
            _ => false,
        }
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self) -> Result<ConnectionId, TransportError> {
        Ok(self.allocate(Slot::Unbound))
    }

    fn bind(&mut self, handle: ConnectionId, _address: &str, port: u16) -> Result<(), TransportError> {
        let slot = self.slot_mut(handle)?;
        match slot {
            Slot::Unbound => {
                *slot = Slot::Bound { port };
                Ok(())
            }
            _ => Err(TransportError::InvalidState(format!("{} is already bound", handle))),
        }
    }

    fn listen(&mut self, handle: ConnectionId) -> Result<(), TransportError> {
        let slot = self.slot_mut(handle)?;
        match *slot {
            Slot::Bound { port } => {
                *slot = Slot::Listening {
                    port,
                    pending: VecDeque::new(),
                };
                Ok(())
            }
            _ => Err(TransportError::InvalidState(format!("{} is not bound", handle))),
        }
    }

    fn connect(&mut self, handle: ConnectionId, _address: &str, _port: u16) -> Result<(), TransportError> {
        let slot = self.slot_mut(handle)?;
        match slot {
            Slot::Unbound => {
                *slot = Slot::Stream(Stream::default());
                Ok(())
            }
            _ => Err(TransportError::InvalidState(format!("{} cannot connect", handle))),
        }
    }

    fn accept(&mut self, handle: ConnectionId) -> Result<Option<ConnectionId>, TransportError> {
        match self.slot_mut(handle)? {
            Slot::Listening { pending, .. } => Ok(pending.pop_front()),
            _ => Err(TransportError::InvalidState(format!("{} is not listening", handle))),
        }
    }

    fn read(&mut self, handle: ConnectionId, max: usize) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream_mut(handle)?;
        if let Some(kind) = stream.read_error.take() {
            return Err(TransportError::Io(io::Error::from(kind)));
        }
        if stream.inbound.is_empty() {
            return if stream.hung_up {
                Ok(Vec::new())
            } else {
                Err(TransportError::WouldBlock)
            };
        }
        let count = max.min(stream.inbound.len());
        Ok(stream.inbound.drain(..count).collect())
    }

    fn write(&mut self, handle: ConnectionId, bytes: &[u8]) -> Result<usize, TransportError> {
        let stream = self.stream_mut(handle)?;
        let count = stream.write_limit.map_or(bytes.len(), |limit| limit.min(bytes.len()));
        stream.outbound.extend_from_slice(&bytes[..count]);
        Ok(count)
    }

    fn close(&mut self, handle: ConnectionId) -> Result<(), TransportError> {
        let slot = self.slot_mut(handle)?;
        let transcript = match slot {
            Slot::Stream(stream) => std::mem::take(&mut stream.outbound),
            Slot::Closed(_) => {
                return Err(TransportError::InvalidState(format!("{} is already closed", handle)))
            }
            _ => Vec::new(),
        };
        *slot = Slot::Closed(transcript);
        Ok(())
    }

    fn poll(&mut self, handles: &[ConnectionId], _timeout: Duration) -> Result<Vec<ConnectionId>, TransportError> {
        self.polls += 1;
        Ok(handles.iter().copied().filter(|handle| self.is_ready(handle)).collect())
    }

    fn local_addr(&self, handle: ConnectionId) -> Result<SocketAddr, TransportError> {
        match self.slots.get(&handle) {
            Some(Slot::Bound { port }) | Some(Slot::Listening { port, .. }) => {
                Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, *port)))
            }
            Some(_) => Err(TransportError::InvalidState(format!("{} has no local address", handle))),
            None => Err(TransportError::UnknownHandle(handle.as_u64())),
        }
    }
}
