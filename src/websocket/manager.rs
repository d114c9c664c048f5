use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::{debug, error, info, warn};

use super::connection::{Connection, ConnectionOptions, HandshakeStatus, ABNORMAL_CLOSURE};
use super::event::{EventEmitter, ListenerId};
use super::frame::{EncodeOptions, Frame};
use crate::config::{ReactorConfig, ServerConfig, Settings};
use crate::error::{Error, TransportError};
use crate::transport::{shared, ConnectionId, SharedTransport, SocketTransport};
use crate::Result;

/// Close code used when the peer closes without giving one.
const NORMAL_CLOSURE: u16 = 1000;
const GOING_AWAY: u16 = 1001;

/// Notifications published by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    Accepted { id: ConnectionId },
    Open { id: ConnectionId },
    Message { id: ConnectionId, frame: Frame },
    Closed { id: ConnectionId, code: u16, reason: Vec<u8> },
}

impl ManagerEvent {
    pub const ACCEPTED: &'static str = "accepted";
    pub const OPEN: &'static str = "open";
    pub const MESSAGE: &'static str = "message";
    pub const CLOSED: &'static str = "closed";

    pub fn name(&self) -> &'static str {
        match self {
            ManagerEvent::Accepted { .. } => Self::ACCEPTED,
            ManagerEvent::Open { .. } => Self::OPEN,
            ManagerEvent::Message { .. } => Self::MESSAGE,
            ManagerEvent::Closed { .. } => Self::CLOSED,
        }
    }
}

/// What one reactor iteration did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tick {
    pub ready: usize,
    pub accepted: usize,
    pub handshakes: usize,
    pub messages: usize,
    pub closed: usize,
    pub failed: usize,
}

enum Step {
    Continue,
    PeerClosed { code: u16, reason: Vec<u8> },
}

/// Owns the listening connection and every accepted peer, and drives them
/// from a single readiness-polling loop.
pub struct ConnectionManager {
    transport: SharedTransport,
    listener_id: ConnectionId,
    /// Listener plus every live peer, keyed by transport handle.
    registry: HashMap<ConnectionId, Connection>,
    config: ReactorConfig,
    events: EventEmitter<ManagerEvent>,
}

impl ConnectionManager {
    /// Creates the listener, starts it on `server.host:server.port` and registers it.
    pub fn new(transport: SharedTransport, server: &ServerConfig, config: ReactorConfig) -> Result<Self> {
        let mut listener = Connection::open(
            transport.clone(),
            server.host.clone(),
            server.port,
            ConnectionOptions::from(&config),
        )?;
        listener.start()?;
        let listener_id = listener.id();

        let mut registry = HashMap::new();
        registry.insert(listener_id, listener);

        let manager = Self {
            transport,
            listener_id,
            registry,
            config,
            events: EventEmitter::new(),
        };

        match manager.local_addr() {
            Ok(addr) => info!(address = %addr, "Socket created"),
            Err(_) => info!(host = %server.host, port = server.port, "Socket created"),
        }
        Ok(manager)
    }

    /// Binds a manager over real TCP sockets.
    pub fn bind(settings: &Settings) -> Result<Self> {
        let (_, transport) = shared(SocketTransport::new()?);
        Self::new(transport, &settings.server, settings.reactor.clone())
    }

    pub fn listener_id(&self) -> ConnectionId {
        self.listener_id
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.transport.borrow().local_addr(self.listener_id)?)
    }

    /// Number of tracked handles, listener included.
    pub fn registry_len(&self) -> usize {
        self.registry.len()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len() - 1
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.registry.contains_key(&id)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.registry.get(&id)
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .registry
            .keys()
            .copied()
            .filter(|id| *id != self.listener_id)
            .collect();
        ids.sort();
        ids
    }

    pub fn on<F>(&self, event: &str, callback: F) -> &Self
    where
        F: Fn(&ManagerEvent) + 'static,
    {
        self.events.on(event, callback);
        self
    }

    /// Registers a consumer for application frames.
    pub fn on_message<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(ConnectionId, &Frame) + 'static,
    {
        self.events.add_listener(ManagerEvent::MESSAGE, move |event| {
            if let ManagerEvent::Message { id, frame } = event {
                callback(*id, frame);
            }
        })
    }

    pub fn remove_listener(&self, event: &str, id: ListenerId) -> &Self {
        self.events.remove_listener(event, id);
        self
    }

    fn emit(&self, event: ManagerEvent) {
        self.events.emit(event.name(), &event);
    }

    /// Runs the reactor until an error escapes it. With failure isolation
    /// enabled only poll failures can end the loop.
    pub fn run(&mut self) -> Result<()> {
        info!(
            listener = %self.listener_id,
            poll_timeout_ms = self.config.poll_timeout_ms,
            "Reactor running"
        );
        loop {
            self.run_once()?;
        }
    }

    /// One poll plus dispatch of every ready handle.
    pub fn run_once(&mut self) -> Result<Tick> {
        let handles: Vec<ConnectionId> = self.registry.keys().copied().collect();
        let ready = self
            .transport
            .borrow_mut()
            .poll(&handles, self.config.poll_timeout())?;

        let mut tick = Tick {
            ready: ready.len(),
            ..Tick::default()
        };

        for id in ready {
            if id == self.listener_id {
                self.accept_pending(&mut tick)?;
            } else if self.registry.contains_key(&id) {
                if let Err(err) = self.service(id, &mut tick) {
                    self.handle_failure(id, err, &mut tick)?;
                }
            }
        }

        Ok(tick)
    }

    /// Sends one frame to a peer whose handshake is complete.
    pub fn send(&mut self, id: ConnectionId, payload: &[u8], options: &EncodeOptions) -> Result<()> {
        let connection = self
            .registry
            .get_mut(&id)
            .filter(|connection| connection.is_handshake_complete())
            .ok_or_else(|| Error::Closed(id.to_string()))?;
        connection.write(payload, options, false)
    }

    /// Sends `payload` to every open peer except `exclude`. Returns how many
    /// peers it reached; peers whose write fails are dropped.
    pub fn broadcast(&mut self, payload: &[u8], options: &EncodeOptions, exclude: Option<ConnectionId>) -> Result<usize> {
        let frame = Frame::encode(payload, options);
        let mut delivered = 0;
        let mut failed = Vec::new();

        for id in self.connection_ids() {
            if Some(id) == exclude {
                continue;
            }
            let Some(connection) = self.registry.get_mut(&id) else {
                continue;
            };
            if !connection.is_handshake_complete() {
                continue;
            }
            match connection.write(&frame, options, true) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    error!(connection = %id, error = %e, "Failed to broadcast");
                    failed.push((id, e));
                }
            }
        }

        let mut tick = Tick::default();
        for (id, err) in failed {
            self.handle_failure(id, err, &mut tick)?;
        }
        Ok(delivered)
    }

    /// Closes one peer with `code` and removes it from the registry.
    pub fn close_connection(&mut self, id: ConnectionId, code: u16, reason: &[u8]) -> Result<()> {
        if id == self.listener_id {
            return Err(TransportError::InvalidState("the listener cannot be closed individually".into()).into());
        }
        let mut connection = self
            .registry
            .remove(&id)
            .ok_or_else(|| Error::Closed(id.to_string()))?;
        let result = if connection.is_handshake_complete() {
            connection.close(code, reason)
        } else {
            connection.abort(code, reason)
        };
        self.emit(ManagerEvent::Closed {
            id,
            code,
            reason: reason.to_vec(),
        });
        result
    }

    /// Closes every peer with 1001 and then the listener.
    pub fn shutdown(mut self) -> Result<()> {
        for id in self.connection_ids() {
            if let Err(e) = self.close_connection(id, GOING_AWAY, b"server shutting down") {
                debug!(connection = %id, error = %e, "Close during shutdown failed");
            }
        }
        if let Some(mut listener) = self.registry.remove(&self.listener_id) {
            listener.abort(GOING_AWAY, b"")?;
        }
        info!("Connection manager shut down");
        Ok(())
    }

    fn accept_pending(&mut self, tick: &mut Tick) -> Result<()> {
        loop {
            let accepted = match self.registry.get_mut(&self.listener_id) {
                Some(listener) => listener.accept()?,
                None => return Err(Error::Closed(self.listener_id.to_string())),
            };
            let Some(mut peer) = accepted else {
                return Ok(());
            };
            let id = peer.id();

            if self.connection_count() >= self.config.max_connections {
                warn!(connection = %id, max_connections = self.config.max_connections, "Connection limit reached");
                if let Err(e) = peer.abort(ABNORMAL_CLOSURE, b"connection limit reached") {
                    debug!(connection = %id, error = %e, "Failed to drop rejected peer");
                }
                continue;
            }

            info!(connection = %id, "Socket accepted");
            self.registry.insert(id, peer);
            tick.accepted += 1;
            self.emit(ManagerEvent::Accepted { id });

            if let Err(err) = self.advance_handshake(id, tick) {
                self.handle_failure(id, err, tick)?;
            }
        }
    }

    fn advance_handshake(&mut self, id: ConnectionId, tick: &mut Tick) -> Result<HandshakeStatus> {
        let Some(connection) = self.registry.get_mut(&id) else {
            return Err(Error::Closed(id.to_string()));
        };
        let status = connection.handshake()?;
        if status == HandshakeStatus::Complete {
            tick.handshakes += 1;
            self.emit(ManagerEvent::Open { id });
        }
        Ok(status)
    }

    fn service(&mut self, id: ConnectionId, tick: &mut Tick) -> Result<()> {
        let handshaking = self
            .registry
            .get(&id)
            .map_or(false, |connection| !connection.is_handshake_complete());
        if handshaking {
            if self.advance_handshake(id, tick)? == HandshakeStatus::Pending {
                return Ok(());
            }
            // the upgrade request may have carried frames with it
            if !self.registry.get(&id).map_or(false, Connection::has_buffered_frame) {
                return Ok(());
            }
        }

        match self.drain_frames(id, tick)? {
            Step::Continue => Ok(()),
            Step::PeerClosed { code, reason } => {
                info!(
                    connection = %id,
                    code,
                    reason = %String::from_utf8_lossy(&reason),
                    "Socket closed"
                );
                self.close_connection(id, code, &reason)?;
                tick.closed += 1;
                Ok(())
            }
        }
    }

    fn drain_frames(&mut self, id: ConnectionId, tick: &mut Tick) -> Result<Step> {
        let Some(connection) = self.registry.get_mut(&id) else {
            return Ok(Step::Continue);
        };

        let mut next = connection.read_frame()?;
        while let Some(frame) = next {
            if frame.is_close() {
                return Ok(Step::PeerClosed {
                    code: frame.close_code.unwrap_or(NORMAL_CLOSURE),
                    reason: frame.close_reason.unwrap_or_default(),
                });
            }

            debug!(
                connection = %id,
                opcode = %frame.opcode,
                length = frame.payload_length,
                "Message from client"
            );
            tick.messages += 1;
            self.events.emit(ManagerEvent::MESSAGE, &ManagerEvent::Message { id, frame });
            next = connection.next_buffered_frame()?;
        }
        Ok(Step::Continue)
    }

    /// Isolates a failed peer, or hands the error back when isolation is off.
    fn handle_failure(&mut self, id: ConnectionId, err: Error, tick: &mut Tick) -> Result<()> {
        if !self.config.isolate_failures {
            return Err(err);
        }
        let Some(mut connection) = self.registry.remove(&id) else {
            return Ok(());
        };

        let code = match &err {
            Error::Transport(TransportError::Disconnected) => {
                info!(connection = %id, "Peer disconnected");
                ABNORMAL_CLOSURE
            }
            _ => {
                warn!(connection = %id, error = %err, "Dropping connection after failure");
                err.close_code().unwrap_or(ABNORMAL_CLOSURE)
            }
        };

        let result = match err.close_code() {
            Some(code) if connection.is_handshake_complete() => connection.close(code, b""),
            _ if matches!(err, Error::Handshake(_)) => connection.reject_handshake(),
            _ => connection.abort(code, b""),
        };
        if let Err(e) = result {
            debug!(connection = %id, error = %e, "Teardown after failure was not clean");
        }

        if matches!(err, Error::Transport(TransportError::Disconnected)) {
            tick.closed += 1;
        } else {
            tick.failed += 1;
        }
        self.emit(ManagerEvent::Closed {
            id,
            code,
            reason: Vec::new(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use crate::websocket::frame::mask_payload;
    use std::cell::RefCell;
    use std::rc::Rc;

    const UPGRADE: &[u8] = b"GET / HTTP/1.1\r\nHost: localhost\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";

    fn manager(config: ReactorConfig) -> (Rc<RefCell<MemoryTransport>>, ConnectionManager) {
        let (memory, transport) = shared(MemoryTransport::new());
        let manager = ConnectionManager::new(transport, &ServerConfig::default(), config).unwrap();
        (memory, manager)
    }

    fn masked(text: &str) -> Vec<u8> {
        mask_payload(text.as_bytes(), &EncodeOptions::default(), [1, 2, 3, 4])
    }

    #[test]
    fn test_listener_registered_on_construction() {
        let (_memory, manager) = manager(ReactorConfig::default());
        assert_eq!(manager.registry_len(), 1);
        assert_eq!(manager.connection_count(), 0);
        assert!(manager.contains(manager.listener_id()));
        assert_eq!(manager.local_addr().unwrap().port(), 4000);
    }

    #[test]
    fn test_idle_tick() {
        let (memory, mut manager) = manager(ReactorConfig::default());
        assert_eq!(manager.run_once().unwrap(), Tick::default());
        assert_eq!(memory.borrow().poll_count(), 1);
    }

    #[test]
    fn test_accept_handshake_and_message() {
        let (memory, mut manager) = manager(ReactorConfig::default());
        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&received);
        manager.on_message(move |id, frame| sink.borrow_mut().push((id, frame.payload.clone())));

        let peer = memory.borrow_mut().push_peer(manager.listener_id()).unwrap();
        memory.borrow_mut().feed(peer, UPGRADE).unwrap();

        let tick = manager.run_once().unwrap();
        assert_eq!(tick.accepted, 1);
        assert_eq!(tick.handshakes, 1);
        assert!(manager.connection(peer).unwrap().is_handshake_complete());

        memory.borrow_mut().feed(peer, &masked("one")).unwrap();
        memory.borrow_mut().feed(peer, &masked("two")).unwrap();
        let tick = manager.run_once().unwrap();
        assert_eq!(tick.messages, 2);
        assert_eq!(
            *received.borrow(),
            vec![(peer, b"one".to_vec()), (peer, b"two".to_vec())]
        );
    }

    #[test]
    fn test_max_connections_enforced() {
        let config = ReactorConfig {
            max_connections: 1,
            ..ReactorConfig::default()
        };
        let (memory, mut manager) = manager(config);
        let first = memory.borrow_mut().push_peer(manager.listener_id()).unwrap();
        let second = memory.borrow_mut().push_peer(manager.listener_id()).unwrap();

        let tick = manager.run_once().unwrap();
        assert_eq!(tick.accepted, 1);
        assert!(manager.contains(first));
        assert!(!manager.contains(second));
        assert!(memory.borrow().is_closed(second));
    }

    #[test]
    fn test_send_requires_open_connection() {
        let (memory, mut manager) = manager(ReactorConfig::default());
        let peer = memory.borrow_mut().push_peer(manager.listener_id()).unwrap();
        manager.run_once().unwrap();

        assert!(matches!(
            manager.send(peer, b"too early", &EncodeOptions::default()),
            Err(Error::Closed(_))
        ));

        memory.borrow_mut().feed(peer, UPGRADE).unwrap();
        manager.run_once().unwrap();
        memory.borrow_mut().take_written(peer);

        manager.send(peer, b"hi", &EncodeOptions::default()).unwrap();
        assert_eq!(memory.borrow_mut().take_written(peer), vec![0x81, 0x02, b'h', b'i']);
    }

    #[test]
    fn test_close_listener_rejected() {
        let (_memory, mut manager) = manager(ReactorConfig::default());
        let listener = manager.listener_id();
        assert!(manager.close_connection(listener, 1000, b"").is_err());
        assert!(manager.contains(listener));
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let (memory, mut manager) = manager(ReactorConfig::default());
        let peer = memory.borrow_mut().push_peer(manager.listener_id()).unwrap();
        memory.borrow_mut().feed(peer, UPGRADE).unwrap();
        manager.run_once().unwrap();
        memory.borrow_mut().take_written(peer);
        let listener = manager.listener_id();

        manager.shutdown().unwrap();

        let frame = Frame::decode(&memory.borrow_mut().take_written(peer)).unwrap();
        assert_eq!(frame.close_code, Some(GOING_AWAY));
        assert!(memory.borrow().is_closed(peer));
        assert!(memory.borrow().is_closed(listener));
    }
}
