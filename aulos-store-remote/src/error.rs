use crate::protocol::ProtocolVersion;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot open connection to remote store '{uri}': {source}")]
    Open {
        uri: String,
        #[source]
        source: Box<ProtocolError>,
    },

    #[error("opening a connection to remote store '{uri}' previously failed")]
    StoreUnreachable { uri: String },

    #[error("protocol mismatch: expected magic {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },

    #[error("daemon protocol version {daemon} is not supported by this client ({client})")]
    IncompatibleVersion {
        daemon: ProtocolVersion,
        client: ProtocolVersion,
    },

    #[error("the daemon is too old (protocol {daemon}, need minor >= 10)")]
    DaemonTooOld { daemon: ProtocolVersion },

    /// The daemon reported an error through the stderr sub-protocol. The
    /// request/response stream is still aligned; the connection stays
    /// usable.
    #[error("daemon error: {message}")]
    Daemon { status: u64, message: String },

    #[error("path '{path}' is not valid")]
    InvalidPath { path: String },

    #[error("string of {length} bytes exceeds maximum {max}")]
    StringTooLong { length: u64, max: u64 },

    #[error("list of {length} entries exceeds maximum {max}")]
    StringListTooLong { length: u64, max: u64 },

    #[error("unknown message type {0:#x} from the daemon")]
    InvalidMsgCode(u64),

    #[error("daemon requested a write but no sink was provided")]
    MissingSink,

    #[error("daemon requested data but no source was provided")]
    MissingSource,

    #[error("{operation} is not supported: {reason}")]
    UnsupportedOperation {
        operation: &'static str,
        reason: String,
    },

    #[error("socket path '{path}' is too long ({len} bytes, limit {max})")]
    SocketPathTooLong {
        path: String,
        len: usize,
        max: usize,
    },

    #[error("output '{output}' of derivation '{drv}' has no known path")]
    UnknownOutputPath { drv: String, output: String },

    #[error("'{0}' is not a recognised store URI")]
    InvalidUri(String),

    #[error("NAR stream error: {0}")]
    Nar(#[from] aulos_store_core::NarCopyError),

    #[error("malformed response: {0}")]
    Decode(String),
}

impl ProtocolError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn decode(err: impl std::fmt::Display) -> Self {
        Self::Decode(err.to_string())
    }

    /// Whether the error came from the daemon's own error report, leaving
    /// the wire stream aligned. Everything else means unread or unsent
    /// bytes, so the connection it happened on must be dropped.
    pub fn keeps_connection(&self) -> bool {
        matches!(
            self,
            ProtocolError::Daemon { .. } | ProtocolError::InvalidPath { .. }
        )
    }
}

/// Extension trait for attaching context to I/O errors.
pub trait IoErrorContext<T> {
    fn io_context(self, context: impl Into<String>) -> Result<T, ProtocolError>;
}

impl<T> IoErrorContext<T> for Result<T, std::io::Error> {
    fn io_context(self, context: impl Into<String>) -> Result<T, ProtocolError> {
        self.map_err(|e| ProtocolError::io(context, e))
    }
}

impl<T> IoErrorContext<T> for Result<T, ProtocolError> {
    fn io_context(self, context: impl Into<String>) -> Result<T, ProtocolError> {
        self.map_err(|e| match e {
            ProtocolError::Io {
                context: inner,
                source,
            } => ProtocolError::Io {
                context: format!("{}: {inner}", context.into()),
                source,
            },
            other => other,
        })
    }
}
