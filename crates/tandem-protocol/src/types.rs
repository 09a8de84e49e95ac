use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

use crate::sdp::SdpError;

/// Media line kind in a session description
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    /// Read an `a=candidate:` value.
    ///
    /// Well-formed candidates this crate cannot reach, such as TCP transports
    /// or mDNS hostnames, come back as `Ok(None)`. Only malformed lines fail.
    pub fn parse(value: &str) -> Result<Option<Self>, SdpError> {
        let invalid = || SdpError::InvalidCandidate(value.to_string());
        let attr = value.strip_prefix("candidate:").unwrap_or(value);
        let parts: Vec<&str> = attr.split_whitespace().collect();
        if parts.len() < 8 || parts[6] != "typ" {
            return Err(invalid());
        }

        let foundation = parts[0].parse().map_err(|_| invalid())?;
        parts[1].parse::<u16>().map_err(|_| invalid())?;
        let priority = parts[3].parse().map_err(|_| invalid())?;
        let port = parts[5].parse().map_err(|_| invalid())?;

        if !parts[2].eq_ignore_ascii_case("udp") {
            return Ok(None);
        }
        let Ok(address) = parts[4].parse::<IpAddr>() else {
            return Ok(None);
        };

        Ok(Some(Candidate {
            foundation,
            priority,
            address,
            port,
        }))
    }
}
