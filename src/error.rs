use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection {0} is closed")]
    Closed(String),
}

// Implement conversion from config::ConfigError
impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(TransportError::from(err))
    }
}

impl Error {
    /// Close code to send when this error tears a connection down, if a close
    /// frame should be written at all.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Error::Protocol(ProtocolError::FrameTooLarge { .. }) => Some(1009),
            Error::Protocol(_) => Some(1002),
            _ => None,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty frame")]
    Empty,

    #[error("Incomplete frame: {needed} more bytes needed")]
    Incomplete { needed: usize },

    #[error("Client frame is not masked")]
    UnmaskedFrame,

    #[error("Frame payload of {size} bytes exceeds the size limit")]
    FrameTooLarge { size: u64 },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Unknown handle: {0}")]
    UnknownHandle(u64),

    #[error("Failed to resolve {0}")]
    Resolve(String),

    #[error("Operation would block")]
    WouldBlock,

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("Invalid socket state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn from_io(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::WouldBlock {
            TransportError::WouldBlock
        } else {
            TransportError::Io(err)
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Missing Sec-WebSocket-Key header")]
    MissingKey,

    #[error("Upgrade request exceeds {limit} bytes")]
    RequestTooLarge { limit: usize },

    #[error("Handshake has not completed")]
    NotComplete,
}
