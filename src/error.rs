use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Consensus error: {0}")]
    Consensus(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Hello timeout after {0} ms")]
    HelloTimeout(u64),

    #[error("Channel not active: {0}")]
    ChannelInactive(String),

    #[error("Phase overflow")]
    PhaseOverflow,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid IP address: {0}")]
    InvalidIpAddress(String),

    #[error("DNS server error: {0}")]
    ServerError(String),

    #[error("Request timeout: {0}")]
    RequestTimeout(String),

    #[error("Unknown domain: {0}")]
    UnknownDomain(String),

    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Shutdown in progress")]
    Shutdown,
}

// Io carries a non-clonable source; cloning demotes it to the string form.
impl Clone for ClusterError {
    fn clone(&self) -> Self {
        match self {
            ClusterError::Io(e) => ClusterError::IoError(e.to_string()),
            ClusterError::IoError(s) => ClusterError::IoError(s.clone()),
            ClusterError::Network(s) => ClusterError::Network(s.clone()),
            ClusterError::Serialization(s) => ClusterError::Serialization(s.clone()),
            ClusterError::Configuration(s) => ClusterError::Configuration(s.clone()),
            ClusterError::Topology(s) => ClusterError::Topology(s.clone()),
            ClusterError::Consensus(s) => ClusterError::Consensus(s.clone()),
            ClusterError::Tls(s) => ClusterError::Tls(s.clone()),
            ClusterError::FrameTooLarge(a, b) => ClusterError::FrameTooLarge(*a, *b),
            ClusterError::HelloTimeout(ms) => ClusterError::HelloTimeout(*ms),
            ClusterError::ChannelInactive(s) => ClusterError::ChannelInactive(s.clone()),
            ClusterError::PhaseOverflow => ClusterError::PhaseOverflow,
            ClusterError::Timeout(s) => ClusterError::Timeout(s.clone()),
            ClusterError::InvalidState(s) => ClusterError::InvalidState(s.clone()),
            ClusterError::NotFound(s) => ClusterError::NotFound(s.clone()),
            ClusterError::AlreadyExists(s) => ClusterError::AlreadyExists(s.clone()),
            ClusterError::InvalidIpAddress(s) => ClusterError::InvalidIpAddress(s.clone()),
            ClusterError::ServerError(s) => ClusterError::ServerError(s.clone()),
            ClusterError::RequestTimeout(s) => ClusterError::RequestTimeout(s.clone()),
            ClusterError::UnknownDomain(s) => ClusterError::UnknownDomain(s.clone()),
            ClusterError::Unknown(s) => ClusterError::Unknown(s.clone()),
            ClusterError::Shutdown => ClusterError::Shutdown,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

// Error conversions for common error types

impl From<bincode::error::EncodeError> for ClusterError {
    fn from(e: bincode::error::EncodeError) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for ClusterError {
    fn from(e: bincode::error::DecodeError) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}
