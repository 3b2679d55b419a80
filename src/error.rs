//! The error hierarchy shared by every component in the connection engine.

use std::fmt;

use crate::frame::Opcode;

/// Top-level error returned to callers of the connection engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("unsupported: {0}")]
    Unsupported(#[from] UnsupportedError),

    #[error("server error (code {code}): {message}")]
    Server {
        code: u32,
        message: String,
        extra: Option<rmpv::Value>,
        stack: Vec<ServerErrorFrame>,
    },

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("request timed out")]
    Timeout,

    #[error("request was cancelled")]
    Cancelled,

    #[error("connection closed (retryable = {retryable})")]
    ConnectionClosed { retryable: bool },
}

impl Error {
    /// True if a caller may reasonably resubmit the same logical request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed { retryable: true } | Error::Transport(_)
        )
    }
}

/// One frame of a server-reported chained error stack.
#[derive(Debug, Clone)]
pub struct ServerErrorFrame {
    pub code: u32,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("transport closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("failed to decode response body: {0}")]
    Decode(String),

    #[error("unsolicited response for sync {sync}")]
    UnsolicitedResponse { sync: u32 },

    #[error("unexpected opcode {0:?} from peer")]
    UnexpectedOpcode(Opcode),

    #[error("greeting banner malformed")]
    BadGreeting,

    #[error("schema resolution failed: {0}")]
    Schema(#[from] SchemaError),
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("server rejected credentials: {0}")]
    Rejected(String),

    #[error("unsupported authentication method {0:?}")]
    UnsupportedMethod(String),
}

#[derive(Debug, thiserror::Error)]
pub enum UnsupportedError {
    #[error("peer is missing required feature {0}")]
    MissingFeature(u32),

    #[error("peer does not support name-based space/index references")]
    NameResolutionUnsupported,
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("space/index name resolution is not supported by this server")]
    NameUnsupported,

    #[error("no such space: {0}")]
    UnknownSpace(String),

    #[error("no such index: {0}")]
    UnknownIndex(String),

    #[error("schema stayed stale after {attempts} refresh attempts")]
    StillStale { attempts: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for ServerErrorFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}
