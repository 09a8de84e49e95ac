use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("empty datagram")]
    Empty,

    #[error("not an RTP packet (first byte {0:#04x})")]
    NotRtp(u8),

    #[error("RTP decode failed: {0}")]
    Decode(String),

    #[error("RTP encode failed: {0}")]
    Encode(String),
}

pub type Result<T> = std::result::Result<T, MediaError>;
