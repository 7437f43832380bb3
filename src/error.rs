use std::io;
use thiserror::Error;

/// WebSocket protocol violations detected while decoding frames.
///
/// Each variant is distinct so a closed connection can be logged precisely.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("reserved bits are nonzero")]
    ReservedBitsNonzero,

    #[error("control frame is fragmented")]
    ControlFrameFragmented,

    #[error("client frame is not masked")]
    UnmaskedClientFrame,

    #[error("server frame is masked")]
    MaskedServerFrame,

    #[error("invalid opcode {0:#x}")]
    InvalidOpcode(u8),

    #[error("invalid payload length")]
    InvalidPayloadLength,

    #[error("continuation frame without a message in progress")]
    BadContinuationFrame,

    #[error("new data frame while a fragmented message is in progress")]
    MessageNotContinued,

    #[error("payload length is not minimally encoded")]
    NonCanonicalLength,

    #[error("control frame payload exceeds 125 bytes")]
    ControlFrameTooLarge,

    #[error("message exceeds {0} bytes")]
    MessageTooLarge(usize),

    #[error("text message is not valid UTF-8")]
    InvalidUtf8,

    #[error("close frame payload is malformed")]
    InvalidClosePayload,
}

impl ProtocolError {
    /// Status code sent in the close frame that answers this violation
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolError::MessageTooLarge(_) => 1009,
            ProtocolError::InvalidUtf8 => 1007,
            _ => 1002,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("listener capacity of {0} registrations exceeded")]
    Capacity(usize),

    #[error("socket {0} is not registered")]
    NotRegistered(u64),

    #[error("socket {0} is already registered")]
    AlreadyRegistered(u64),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when the underlying I/O call would have blocked
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }

    /// True for transport failures caused by the peer going away
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// True when the process or system ran out of descriptors or buffers
    pub fn is_resource_exhausted(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.raw_os_error(),
                Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
            ),
            _ => false,
        }
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        Error::State(msg.into())
    }
}
