//! Error types for the Teredo endpoint.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the Teredo endpoint.
#[derive(Error, Debug)]
pub enum Error {
    /// A parameter was outside its permitted range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Tunnel device errors
    #[error("Tunnel device error: {0}")]
    TunDevice(String),

    /// Relay or server object could not be brought into service
    #[error("Service failure: {0}")]
    ServiceFailure(String),

    /// Privilege-separation channel error
    #[error("Privilege separation error: {0}")]
    PrivSep(String),

    /// The privileged helper refused or failed a request
    #[error("Privileged helper rejected request")]
    HelperRejected,

    /// A Teredo address did not parse
    #[error("Invalid Teredo address: {0}")]
    TeredoAddress(String),
}

impl Error {
    /// Create a new invalid-argument error.
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a new tunnel device error.
    pub fn tun<S: Into<String>>(msg: S) -> Self {
        Self::TunDevice(msg.into())
    }

    /// Create a new service failure error.
    pub fn service<S: Into<String>>(msg: S) -> Self {
        Self::ServiceFailure(msg.into())
    }

    /// Wrap the calling thread's errno as a tunnel device error.
    pub fn last_os<S: Into<String>>(what: S) -> Self {
        Self::TunDevice(format!(
            "{}: {}",
            what.into(),
            std::io::Error::last_os_error()
        ))
    }
}
