//! Error types for the bulk security subsystem.

use thiserror::Error;

/// Result type alias for descriptor and checksum operations.
pub type SecResult<T> = Result<T, SecError>;

/// Page pool failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The pool could not hand out the requested pages without waiting
    /// (background caller), past its capacity, or after a failed grow.
    #[error("out of memory: requested {requested} pages, {free} free of {total}")]
    OutOfMemory {
        /// Pages requested by the descriptor.
        requested: usize,
        /// Free pages at the time of refusal.
        free: usize,
        /// Pages committed to the pool at the time of refusal.
        total: usize,
    },

    /// A page allocation failed while growing; nothing was committed.
    #[error("failed to allocate {pages} pool pages")]
    GrowFailed {
        /// Size of the batch that was rolled back.
        pages: usize,
    },

    /// The descriptor asks for nothing.
    #[error("invalid page request: {0}")]
    InvalidRequest(String),
}

/// Bulk security descriptor and checksum errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecError {
    /// Buffer shorter than the fixed descriptor header.
    #[error("invalid bulk sec desc: size {size} (need {expected})")]
    InvalidSize {
        /// Bytes available.
        size: usize,
        /// Bytes required.
        expected: usize,
    },

    /// Descriptor version is not the single supported one.
    #[error("unexpected bulk sec desc version {0}")]
    UnsupportedVersion(u8),

    /// Transfer type out of range.
    #[error("invalid bulk type {0}")]
    InvalidBulkType(u8),

    /// Service level is not null, integrity or privacy.
    #[error("invalid bulk service {0}")]
    InvalidService(u8),

    /// Hash algorithm id or name is unknown, or not usable for checksums.
    #[error("unsupported bulk hash algorithm {0}")]
    UnsupportedAlgorithm(String),

    /// Caller's digest buffer is too short.
    #[error("checksum buffer too small: {len} bytes (min {min})")]
    BufferTooSmall {
        /// Buffer length supplied.
        len: usize,
        /// Minimum accepted length.
        min: usize,
    },

    /// Fragment range does not lie inside its page.
    #[error("fragment {offset}+{len} exceeds page of {page_size} bytes")]
    InvalidFragment {
        /// Offset into the page.
        offset: usize,
        /// Length of the active range.
        len: usize,
        /// Size of the page.
        page_size: usize,
    },
}

impl SecError {
    /// Returns `true` for wire validation failures; the message must be dropped.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SecError::UnsupportedVersion(_)
                | SecError::InvalidBulkType(_)
                | SecError::InvalidService(_)
        )
    }
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the configuration file failed.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// TOML syntax or schema error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON syntax or schema error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The file extension is neither `.toml` nor `.json`.
    #[error("unsupported config file extension: {0:?}")]
    UnsupportedExtension(String),

    /// An environment override could not be parsed.
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },

    /// A field holds an unusable value.
    #[error("invalid config: {0}")]
    Invalid(String),
}
