use std::collections::HashMap;
use std::fmt;

use tracing::{debug, info, warn};

use super::event::{EventEmitter, ListenerId};
use super::frame::{EncodeOptions, Frame, FrameSize};
use super::handshake;
use crate::config::ReactorConfig;
use crate::error::{Error, HandshakeError, ProtocolError, TransportError};
use crate::transport::{ConnectionId, SharedTransport};
use crate::Result;

/// Upgrade requests may span at most this many read budgets.
const MAX_REQUEST_READS: usize = 8;

/// Close code reported when the peer vanished without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Listening,
    Connected,
    /// Accepted peer waiting for its upgrade request.
    Handshaking,
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect { address: String, port: u16 },
    Accept { id: ConnectionId },
    Message(Frame),
    Close { reason: Vec<u8>, code: u16 },
}

impl ConnectionEvent {
    pub const CONNECT: &'static str = "connect";
    pub const ACCEPT: &'static str = "accept";
    pub const MESSAGE: &'static str = "message";
    pub const CLOSE: &'static str = "close";

    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::Connect { .. } => Self::CONNECT,
            ConnectionEvent::Accept { .. } => Self::ACCEPT,
            ConnectionEvent::Message(_) => Self::MESSAGE,
            ConnectionEvent::Close { .. } => Self::CLOSE,
        }
    }
}

/// Result of [`Connection::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// Bytes read before the handshake completed.
    Raw(Vec<u8>),
    Frame(Frame),
    /// Nothing complete is available yet.
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Pending,
    Complete,
}

/// Per-connection protocol knobs, usually taken from [`ReactorConfig`].
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub read_budget: usize,
    pub max_frame_size: u64,
    pub require_masked_frames: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ReactorConfig::default().into()
    }
}

impl From<ReactorConfig> for ConnectionOptions {
    fn from(config: ReactorConfig) -> Self {
        Self {
            read_budget: config.read_budget,
            max_frame_size: config.max_frame_size,
            require_masked_frames: config.require_masked_frames,
        }
    }
}

impl From<&ReactorConfig> for ConnectionOptions {
    fn from(config: &ReactorConfig) -> Self {
        config.clone().into()
    }
}

/// One socket endpoint: the listener or an accepted peer.
pub struct Connection {
    id: ConnectionId,
    address: String,
    port: u16,
    transport: SharedTransport,
    options: ConnectionOptions,
    state: ConnectionState,
    headers: HashMap<String, String>,
    /// Bytes received but not yet consumed by the handshake or a frame.
    buffer: Vec<u8>,
    events: EventEmitter<ConnectionEvent>,
}

impl Connection {
    /// Creates a fresh socket through `transport`.
    pub fn open(
        transport: SharedTransport,
        address: impl Into<String>,
        port: u16,
        options: ConnectionOptions,
    ) -> Result<Self> {
        let id = transport.borrow_mut().open()?;
        Ok(Self::with_handle(transport, id, address.into(), port, options, ConnectionState::Created))
    }

    fn with_handle(
        transport: SharedTransport,
        id: ConnectionId,
        address: String,
        port: u16,
        options: ConnectionOptions,
        state: ConnectionState,
    ) -> Self {
        Self {
            id,
            address,
            port,
            transport,
            options,
            state,
            headers: HashMap::new(),
            buffer: Vec::new(),
            events: EventEmitter::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        handshake::header(&self.headers, name)
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn on<F>(&self, event: &str, callback: F) -> &Self
    where
        F: Fn(&ConnectionEvent) + 'static,
    {
        self.events.on(event, callback);
        self
    }

    pub fn once<F>(&self, event: &str, callback: F) -> &Self
    where
        F: Fn(&ConnectionEvent) + 'static,
    {
        self.events.once(event, callback);
        self
    }

    pub fn add_listener<F>(&self, event: &str, callback: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) + 'static,
    {
        self.events.add_listener(event, callback)
    }

    pub fn remove_listener(&self, event: &str, id: ListenerId) -> &Self {
        self.events.remove_listener(event, id);
        self
    }

    fn emit(&self, event: ConnectionEvent) {
        self.events.emit(event.name(), &event);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed(self.id.to_string()));
        }
        Ok(())
    }

    /// Frames only exist once the upgrade has gone through.
    fn ensure_frames(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.is_handshake_complete() {
            return Err(HandshakeError::NotComplete.into());
        }
        Ok(())
    }

    /// Emits `connect`, then opens an outbound connection to address:port.
    pub fn connect(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.emit(ConnectionEvent::Connect {
            address: self.address.clone(),
            port: self.port,
        });
        self.transport
            .borrow_mut()
            .connect(self.id, &self.address, self.port)?;
        self.state = ConnectionState::Connected;
        Ok(())
    }

    /// Binds to address:port and starts listening.
    pub fn start(&mut self) -> Result<()> {
        self.ensure_open()?;
        {
            let mut transport = self.transport.borrow_mut();
            transport.bind(self.id, &self.address, self.port)?;
            transport.listen(self.id)?;
        }
        self.state = ConnectionState::Listening;
        debug!(connection = %self.id, address = %self.address, port = self.port, "Listening");
        Ok(())
    }

    /// Takes the next pending peer off the listener.
    ///
    /// Returns `None` when nobody is waiting. Accept failures are logged and
    /// also reported as `None`.
    pub fn accept(&mut self) -> Result<Option<Connection>> {
        self.ensure_open()?;
        let accepted = self.transport.borrow_mut().accept(self.id);
        let peer = match accepted {
            Ok(Some(peer)) => peer,
            Ok(None) | Err(TransportError::WouldBlock) => return Ok(None),
            Err(e) => {
                warn!(listener = %self.id, error = %e, "Accept failed");
                return Ok(None);
            }
        };

        let connection = Connection::with_handle(
            self.transport.clone(),
            peer,
            self.address.clone(),
            self.port,
            self.options,
            ConnectionState::Handshaking,
        );
        self.emit(ConnectionEvent::Accept { id: peer });
        Ok(Some(connection))
    }

    /// Sends `text`, framed unless `raw` is set.
    ///
    /// A write the transport only partly accepts fails with
    /// [`TransportError::ShortWrite`]; the remainder is not retried.
    pub fn write(&mut self, text: &[u8], options: &EncodeOptions, raw: bool) -> Result<()> {
        self.ensure_open()?;
        if raw {
            self.write_bytes(text)
        } else {
            self.write_bytes(&Frame::encode(text, options))
        }
    }

    pub fn send_text(&mut self, text: &str) -> Result<()> {
        self.write(text.as_bytes(), &EncodeOptions::default(), false)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let written = self.transport.borrow_mut().write(self.id, bytes)?;
        if written < bytes.len() {
            return Err(TransportError::ShortWrite {
                written,
                expected: bytes.len(),
            }
            .into());
        }
        Ok(())
    }

    /// Raw bytes before the handshake, decoded frames after it.
    pub fn read(&mut self) -> Result<Incoming> {
        match self.state {
            ConnectionState::Closed => Err(Error::Closed(self.id.to_string())),
            ConnectionState::Open => Ok(self.read_frame()?.map_or(Incoming::Pending, Incoming::Frame)),
            _ => Ok(self.read_raw()?.map_or(Incoming::Pending, Incoming::Raw)),
        }
    }

    /// One read of at most the read budget. `None` when the transport had nothing.
    pub fn read_raw(&mut self) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        let result = self.transport.borrow_mut().read(self.id, self.options.read_budget);
        match result {
            Ok(bytes) if bytes.is_empty() => Err(TransportError::Disconnected.into()),
            Ok(bytes) => Ok(Some(bytes)),
            Err(TransportError::WouldBlock) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Next frame from the peer, reading from the transport only when the
    /// buffer holds no complete frame. Emits `message` for every frame returned.
    pub fn read_frame(&mut self) -> Result<Option<Frame>> {
        self.ensure_frames()?;
        if let Some(frame) = self.next_buffered_frame()? {
            return Ok(Some(frame));
        }
        match self.read_raw()? {
            Some(bytes) => {
                self.buffer.extend_from_slice(&bytes);
                self.next_buffered_frame()
            }
            None => Ok(None),
        }
    }

    /// Decodes a frame already sitting in the buffer without touching the transport.
    ///
    /// A header announcing more than `max_frame_size` payload bytes fails with
    /// [`ProtocolError::FrameTooLarge`] as soon as the header is in, without waiting for the payload.
    pub fn next_buffered_frame(&mut self) -> Result<Option<Frame>> {
        self.ensure_frames()?;
        let Some(size) = self.buffered_frame_size()? else {
            return Ok(None);
        };
        if self.buffer.len() < size.total {
            return Ok(None);
        }
        let Some((frame, used)) = Frame::parse(&self.buffer)? else {
            return Ok(None);
        };
        self.buffer.drain(..used);

        if self.options.require_masked_frames && !frame.masked {
            return Err(ProtocolError::UnmaskedFrame.into());
        }

        self.emit(ConnectionEvent::Message(frame.clone()));
        Ok(Some(frame))
    }

    /// Advances the opening handshake with whatever the peer has sent so far.
    pub fn handshake(&mut self) -> Result<HandshakeStatus> {
        self.ensure_open()?;
        if self.is_handshake_complete() {
            return Ok(HandshakeStatus::Complete);
        }

        if !handshake::request_complete(&self.buffer) {
            match self.read_raw()? {
                Some(bytes) => self.buffer.extend_from_slice(&bytes),
                None => return Ok(HandshakeStatus::Pending),
            }
        }

        let Some(end) = self
            .buffer
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
        else {
            let limit = self.options.read_budget * MAX_REQUEST_READS;
            if self.buffer.len() > limit {
                return Err(HandshakeError::RequestTooLarge { limit }.into());
            }
            return Ok(HandshakeStatus::Pending);
        };

        // Anything after the blank line already belongs to the frame stream.
        let head: Vec<u8> = self.buffer.drain(..end + 4).collect();
        let request = String::from_utf8_lossy(&head);
        let headers = handshake::parse_headers(&request);
        let token = handshake::token_for(&headers)?;

        self.headers = headers;
        self.write_bytes(handshake::response(&token).as_bytes())?;
        self.state = ConnectionState::Open;

        info!(connection = %self.id, "Handshake complete");
        Ok(HandshakeStatus::Complete)
    }

    /// True when the buffer holds a complete frame, or a header that
    /// [`next_buffered_frame`](Self::next_buffered_frame) will reject.
    pub fn has_buffered_frame(&self) -> bool {
        if !self.is_handshake_complete() {
            return false;
        }
        match self.buffered_frame_size() {
            Ok(Some(size)) => self.buffer.len() >= size.total,
            Ok(None) => false,
            Err(_) => true,
        }
    }

    fn buffered_frame_size(&self) -> Result<Option<FrameSize>> {
        let Some(size) = Frame::peek(&self.buffer)? else {
            return Ok(None);
        };
        if size.payload_length > self.options.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: size.payload_length,
            }
            .into());
        }
        Ok(Some(size))
    }

    /// Sends a close frame, emits `close`, and releases the handle.
    ///
    /// The handle is released even when the close frame cannot be written;
    /// that write error is returned afterwards.
    pub fn close(&mut self, code: u16, reason: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let written = self.write_bytes(&Frame::close(code, reason));
        self.finish(code, reason)?;
        written
    }

    /// Emits `close` and releases the handle without writing anything.
    pub fn abort(&mut self, code: u16, reason: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.finish(code, reason)
    }

    /// Answers a failed upgrade with `400 Bad Request` and drops the peer.
    pub fn reject_handshake(&mut self) -> Result<()> {
        self.ensure_open()?;
        if let Err(e) = self.write_bytes(handshake::bad_request().as_bytes()) {
            debug!(connection = %self.id, error = %e, "Could not send 400 response");
        }
        self.finish(ABNORMAL_CLOSURE, b"handshake failed")
    }

    fn finish(&mut self, code: u16, reason: &[u8]) -> Result<()> {
        self.emit(ConnectionEvent::Close {
            reason: reason.to_vec(),
            code,
        });
        self.state = ConnectionState::Closed;
        self.buffer.clear();
        self.transport.borrow_mut().close(self.id)?;
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if let Ok(mut transport) = self.transport.try_borrow_mut() {
            let _ = transport.close(self.id);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("state", &self.state)
            .field("headers", &self.headers)
            .field("buffered", &self.buffer.len())
            .field("events", &self.events)
            .finish()
    }
}
