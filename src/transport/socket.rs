//! TCP transport over mio's readiness API.
//!
//! mio reports readiness edge-triggered, while the reactor expects a handle to
//! stay ready until it has been drained. Handles that produced data (or an
//! accepted peer) are therefore kept in a carry set and reported again, with a
//! zero poll timeout, until an operation on them answers `WouldBlock`.

use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use super::{ConnectionId, Transport};
use crate::error::TransportError;

const EVENT_CAPACITY: usize = 1024;

enum Socket {
    Unbound,
    Bound(std::net::TcpListener),
    Listener(TcpListener),
    Stream(TcpStream),
}

pub struct SocketTransport {
    poll: Poll,
    events: Events,
    sockets: HashMap<ConnectionId, Socket>,
    carry: HashSet<ConnectionId>,
    next_id: u64,
}

impl SocketTransport {
    pub fn new() -> Result<Self, TransportError> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
            sockets: HashMap::new(),
            carry: HashSet::new(),
            next_id: 0,
        })
    }

    fn allocate(&mut self, socket: Socket) -> ConnectionId {
        self.next_id += 1;
        let id = ConnectionId::new(self.next_id);
        self.sockets.insert(id, socket);
        id
    }

    fn socket_mut(&mut self, handle: ConnectionId) -> Result<&mut Socket, TransportError> {
        self.sockets
            .get_mut(&handle)
            .ok_or(TransportError::UnknownHandle(handle.as_u64()))
    }

    fn stream_mut(&mut self, handle: ConnectionId) -> Result<&mut TcpStream, TransportError> {
        match self.socket_mut(handle)? {
            Socket::Stream(stream) => Ok(stream),
            _ => Err(TransportError::InvalidState(format!("{} is not a stream", handle))),
        }
    }
}

fn resolve(address: &str, port: u16) -> Result<SocketAddr, TransportError> {
    (address, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| TransportError::Resolve(format!("{}:{}", address, port)))
}

fn token(handle: ConnectionId) -> Token {
    Token(handle.as_u64() as usize)
}

impl Transport for SocketTransport {
    fn open(&mut self) -> Result<ConnectionId, TransportError> {
        Ok(self.allocate(Socket::Unbound))
    }

    fn bind(&mut self, handle: ConnectionId, address: &str, port: u16) -> Result<(), TransportError> {
        let addr = resolve(address, port)?;
        let socket = self.socket_mut(handle)?;
        if !matches!(socket, Socket::Unbound) {
            return Err(TransportError::InvalidState(format!("{} is already in use", handle)));
        }
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        *socket = Socket::Bound(listener);
        Ok(())
    }

    fn listen(&mut self, handle: ConnectionId) -> Result<(), TransportError> {
        let socket = self.socket_mut(handle)?;
        let bound = match std::mem::replace(socket, Socket::Unbound) {
            Socket::Bound(listener) => listener,
            other => {
                *socket = other;
                return Err(TransportError::InvalidState(format!("{} is not bound", handle)));
            }
        };
        let mut listener = TcpListener::from_std(bound);
        self.poll
            .registry()
            .register(&mut listener, token(handle), Interest::READABLE)?;
        self.sockets.insert(handle, Socket::Listener(listener));
        Ok(())
    }

    fn connect(&mut self, handle: ConnectionId, address: &str, port: u16) -> Result<(), TransportError> {
        let addr = resolve(address, port)?;
        if !matches!(self.socket_mut(handle)?, Socket::Unbound) {
            return Err(TransportError::InvalidState(format!("{} is already in use", handle)));
        }
        let mut stream = TcpStream::connect(addr)?;
        self.poll
            .registry()
            .register(&mut stream, token(handle), Interest::READABLE)?;
        self.sockets.insert(handle, Socket::Stream(stream));
        Ok(())
    }

    fn accept(&mut self, handle: ConnectionId) -> Result<Option<ConnectionId>, TransportError> {
        let accepted = match self.socket_mut(handle)? {
            Socket::Listener(listener) => listener.accept(),
            _ => return Err(TransportError::InvalidState(format!("{} is not listening", handle))),
        };

        match accepted {
            Ok((mut stream, peer_addr)) => {
                let peer = self.allocate(Socket::Unbound);
                if let Err(e) = self
                    .poll
                    .registry()
                    .register(&mut stream, token(peer), Interest::READABLE)
                {
                    self.sockets.remove(&peer);
                    return Err(TransportError::Io(e));
                }
                self.sockets.insert(peer, Socket::Stream(stream));
                self.carry.insert(handle);
                tracing::debug!(listener = %handle, peer = %peer, peer_addr = %peer_addr, "Accepted TCP connection");
                Ok(Some(peer))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.carry.remove(&handle);
                Ok(None)
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn read(&mut self, handle: ConnectionId, max: usize) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream_mut(handle)?;
        let mut buf = vec![0u8; max];
        let result = loop {
            match stream.read(&mut buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        match result {
            Ok(n) => {
                buf.truncate(n);
                self.carry.insert(handle);
                Ok(buf)
            }
            Err(e) => {
                self.carry.remove(&handle);
                Err(TransportError::from_io(e))
            }
        }
    }

    fn write(&mut self, handle: ConnectionId, bytes: &[u8]) -> Result<usize, TransportError> {
        let stream = self.stream_mut(handle)?;
        let mut written = 0;
        while written < bytes.len() {
            match stream.write(&bytes[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
        Ok(written)
    }

    fn close(&mut self, handle: ConnectionId) -> Result<(), TransportError> {
        let socket = self
            .sockets
            .remove(&handle)
            .ok_or(TransportError::UnknownHandle(handle.as_u64()))?;
        self.carry.remove(&handle);

        match socket {
            Socket::Listener(mut listener) => {
                self.poll.registry().deregister(&mut listener)?;
            }
            Socket::Stream(mut stream) => {
                self.poll.registry().deregister(&mut stream)?;
                // The peer may already be gone.
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
            Socket::Unbound | Socket::Bound(_) => {}
        }
        Ok(())
    }

    fn poll(&mut self, handles: &[ConnectionId], timeout: Duration) -> Result<Vec<ConnectionId>, TransportError> {
        let wanted: HashSet<ConnectionId> = handles.iter().copied().collect();
        let timeout = if self.carry.iter().any(|handle| wanted.contains(handle)) {
            Duration::ZERO
        } else {
            timeout
        };

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(TransportError::Io(e)),
        }

        for event in self.events.iter() {
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                let handle = ConnectionId::new(event.token().0 as u64);
                if self.sockets.contains_key(&handle) {
                    self.carry.insert(handle);
                }
            }
        }

        let mut ready: Vec<ConnectionId> = handles
            .iter()
            .copied()
            .filter(|handle| self.carry.contains(handle))
            .collect();
        ready.sort();
        Ok(ready)
    }

    fn local_addr(&self, handle: ConnectionId) -> Result<SocketAddr, TransportError> {
        let addr = match self.sockets.get(&handle) {
            Some(Socket::Bound(listener)) => listener.local_addr()?,
            Some(Socket::Listener(listener)) => listener.local_addr()?,
            Some(Socket::Stream(stream)) => stream.local_addr()?,
            Some(Socket::Unbound) => {
                return Err(TransportError::InvalidState(format!("{} is not bound", handle)))
            }
            None => return Err(TransportError::UnknownHandle(handle.as_u64())),
        };
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::time::Instant;

    fn wait_ready(transport: &mut SocketTransport, handle: ConnectionId) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let ready = transport.poll(&[handle], Duration::from_millis(50)).unwrap();
            if ready.contains(&handle) {
                return true;
            }
        }
        false
    }

    #[test]
    fn test_accept_and_read() {
        let mut transport = SocketTransport::new().unwrap();
        let listener = transport.open().unwrap();
        transport.bind(listener, "127.0.0.1", 0).unwrap();
        transport.listen(listener).unwrap();
        let addr = transport.local_addr(listener).unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        assert!(wait_ready(&mut transport, listener));
        let peer = transport.accept(listener).unwrap().expect("pending peer");

        client.write_all(b"ping").unwrap();
        assert!(wait_ready(&mut transport, peer));
        assert_eq!(transport.read(peer, 1024).unwrap(), b"ping");

        // drained: the next read reports WouldBlock and clears the carry
        assert!(matches!(transport.read(peer, 1024), Err(TransportError::WouldBlock)));
        assert!(transport.poll(&[peer], Duration::from_millis(10)).unwrap().is_empty());

        transport.close(peer).unwrap();
        assert!(matches!(transport.read(peer, 16), Err(TransportError::UnknownHandle(_))));
    }

    #[test]
    fn test_accept_without_pending_peer() {
        let mut transport = SocketTransport::new().unwrap();
        let listener = transport.open().unwrap();
        transport.bind(listener, "127.0.0.1", 0).unwrap();
        transport.listen(listener).unwrap();

        assert_eq!(transport.accept(listener).unwrap(), None);
    }

    #[test]
    fn test_listen_requires_bind() {
        let mut transport = SocketTransport::new().unwrap();
        let handle = transport.open().unwrap();
        assert!(matches!(transport.listen(handle), Err(TransportError::InvalidState(_))));
    }
}
