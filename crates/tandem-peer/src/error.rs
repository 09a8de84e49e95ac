use tandem_protocol::SdpError;
use thiserror::Error;

use crate::dtls::DtlsError;
use crate::ice::LocalPath;

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Session already initiated")]
    Reinitiation,

    #[error("No local path could be bound ({} failed)", .failures.len())]
    NoPathsAvailable { failures: Vec<PathBindFailure> },

    #[error("Path bind failed: {0}")]
    PathBind(PathBindFailure),

    #[error("Path enumeration failed: {0}")]
    Enumeration(#[source] std::io::Error),

    #[error("Secure transport context: {0}")]
    Generation(#[from] DtlsError),

    #[error("Invalid session description: {0}")]
    InvalidDescription(#[from] SdpError),

    #[error("Remote description already set")]
    RemoteDescriptionAlreadySet,

    #[error("Peer connection closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// One enumerated path that could not be bound
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("path #{index} {path}: {reason}")]
pub struct PathBindFailure {
    /// Position in enumeration order
    pub index: usize,
    pub path: LocalPath,
    pub reason: String,
}

pub type Result<T> = std::result::Result<T, PeerError>;
