use thiserror::Error;

pub type Result<T> = std::result::Result<T, P2PError>;

#[derive(Error, Debug)]
pub enum P2PError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Address resolution failed: {0}")]
    ResolutionFailed(String),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    #[error("Connection {0} has not joined")]
    NotJoined(u64),

    #[error("Peer address unavailable: {0}")]
    AddressUnavailable(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<std::io::Error> for P2PError {
    fn from(err: std::io::Error) -> Self {
        P2PError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for P2PError {
    fn from(err: serde_json::Error) -> Self {
        P2PError::ConfigError(err.to_string())
    }
}
