//! Error types for the socket and interface layer.

use thiserror::Error;

/// Result type alias for network operations.
pub type NetResult<T> = Result<T, NetError>;

/// Error variants for socket and interface operations.
#[derive(Debug, Error)]
pub enum NetError {
    /// Wraps OS-level socket/ioctl errors, errno preserved.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Interface name does not fit the kernel's fixed-size name field.
    #[error("interface name {name:?} too long ({max} max)")]
    NameTooLong {
        /// The offending name (possibly lossy).
        name: String,
        /// Platform limit including the terminating NUL.
        max: usize,
    },

    /// A send moved zero bytes.
    #[error("connection aborted: send returned zero bytes")]
    ConnectionAborted,

    /// The peer closed the connection mid-read.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// Read deadline exhausted before the buffer was filled.
    #[error("read timed out after {timeout_ms}ms")]
    TimedOut {
        /// The total timeout originally requested.
        timeout_ms: u64,
    },

    /// Send deadline exhausted, or the send buffer is full in non-blocking mode.
    #[error("send would block")]
    WouldBlock,

    /// Caller violated an argument precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl NetError {
    /// Returns `true` for the expected, caller-recoverable timeout outcomes.
    pub fn is_timeout(&self) -> bool {
        matches!(self, NetError::TimedOut { .. } | NetError::WouldBlock)
    }

    /// Returns the raw OS error code, if this error came from the OS.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            NetError::IoError(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// Failure to create, bind or connect a socket.
///
/// `fatal == false` tells the caller to retry with different parameters
/// (another local port); everything else is final.
#[derive(Debug, Error)]
#[error("socket setup failed (fatal: {fatal}): {source}")]
pub struct SocketSetupError {
    /// Whether retrying with other parameters is pointless.
    pub fatal: bool,
    /// The underlying error.
    #[source]
    pub source: NetError,
}

impl SocketSetupError {
    pub(crate) fn fatal(source: impl Into<NetError>) -> Self {
        Self {
            fatal: true,
            source: source.into(),
        }
    }

    pub(crate) fn retryable(source: impl Into<NetError>) -> Self {
        Self {
            fatal: false,
            source: source.into(),
        }
    }

    /// Returns `true` if the caller should not retry.
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }
}

impl From<SocketSetupError> for NetError {
    fn from(err: SocketSetupError) -> Self {
        err.source
    }
}
