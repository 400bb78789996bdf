//! Common error types for the Cachet ecosystem.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`CachetError`].
pub type CachetResult<T> = Result<T, CachetError>;

/// Common errors across the Cachet ecosystem.
#[derive(Error, Diagnostic, Debug)]
pub enum CachetError {
    /// No free instance of a finite hardware resource is left.
    #[error("Resource exhausted: {resource}")]
    #[diagnostic(
        code(cachet::resource_exhausted),
        help("Release an allocation before requesting a new one")
    )]
    ResourceExhausted {
        /// The exhausted resource.
        resource: String,
    },

    /// A request exceeds what policy or hardware allows.
    #[error("Capacity violation: {message}")]
    #[diagnostic(code(cachet::capacity_violation))]
    CapacityViolation {
        /// What was requested and what the limit is.
        message: String,
    },

    /// A request conflicts with configured pool policy.
    #[error("Policy violation: {message}")]
    #[diagnostic(code(cachet::policy_violation))]
    PolicyViolation {
        /// The policy rule that was violated.
        message: String,
    },

    /// Feature not supported by the hardware or current mount state.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(
        code(cachet::unsupported),
        help("Check `grep rdt /proc/cpuinfo` and the resctrl mount options")
    )]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// A named entity does not exist.
    #[error("Not found: {what}")]
    #[diagnostic(code(cachet::not_found))]
    NotFound {
        /// The entity that was not found.
        what: String,
    },

    /// An operation is not valid in the current state.
    #[error("Invalid state: {message}")]
    #[diagnostic(code(cachet::invalid_state))]
    InvalidState {
        /// Why the operation was rejected.
        message: String,
    },

    /// Bit index outside the fixed width of a bitmap.
    #[error("Bit index {index} out of range for width {width}")]
    #[diagnostic(code(cachet::invalid_bit))]
    InvalidBit {
        /// The offending index.
        index: usize,
        /// The bitmap width.
        width: usize,
    },

    /// A mask or cpu-list string could not be parsed.
    #[error("Invalid mask: {value}")]
    #[diagnostic(
        code(cachet::invalid_mask),
        help("Cache masks are hexadecimal; cpu lists look like '0-2,5'")
    )]
    InvalidMask {
        /// The unparseable value.
        value: String,
    },

    /// A task identifier did not parse as a process ID.
    #[error("Invalid pid: {pid}")]
    #[diagnostic(code(cachet::invalid_pid))]
    InvalidPid {
        /// The invalid identifier.
        pid: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(cachet::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(cachet::io))]
    Io(#[from] std::io::Error),

    /// I/O error with the failing path attached.
    #[error("I/O error on {path}: {source}")]
    #[diagnostic(code(cachet::io))]
    FileIo {
        /// The path the operation failed on.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Permission denied.
    #[error("Permission denied: {operation}")]
    #[diagnostic(
        code(cachet::permission_denied),
        help("Writing resctrl groups requires elevated privileges (sudo)")
    )]
    PermissionDenied {
        /// The operation that was denied.
        operation: String,
    },
}

impl CachetError {
    /// Wrap an I/O error with the path it occurred on, mapping permission
    /// failures to their own variant.
    pub fn file_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            Self::PermissionDenied {
                operation: format!("write {}", path.display()),
            }
        } else {
            Self::FileIo { path, source }
        }
    }
}
