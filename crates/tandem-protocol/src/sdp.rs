//! Session description model
//!
//! Renders the offer advertised to the remote peer and reads back the
//! attributes this crate needs from a remote description: ICE credentials,
//! the certificate fingerprint, candidates, codecs and stream sources.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Write};
use thiserror::Error;

use crate::types::{Candidate, MediaKind, TrackType};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdpError {
    #[error("description does not start with v=0")]
    MissingVersion,

    #[error("malformed line: {0}")]
    MalformedLine(String),

    #[error("invalid origin: {0}")]
    InvalidOrigin(String),

    #[error("invalid media line: {0}")]
    InvalidMedia(String),

    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),
}

pub type Result<T> = std::result::Result<T, SdpError>;

/// Certificate fingerprint (`a=fingerprint`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fingerprint {
    pub algorithm: String,
    pub value: String,
}

impl Fingerprint {
    pub fn sha256(value: impl Into<String>) -> Self {
        Self {
            algorithm: "sha-256".to_string(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.algorithm, self.value)
    }
}

/// One `m=` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaSection {
    pub kind: MediaKind,
    pub mid: String,
    /// Codecs in preference order
    pub codecs: Vec<TrackType>,
    /// Stream sources announced with `a=ssrc`
    pub ssrcs: Vec<u32>,
}

impl MediaSection {
    pub fn new(kind: MediaKind, mid: impl Into<String>) -> Self {
        Self {
            kind,
            mid: mid.into(),
            codecs: Vec::new(),
            ssrcs: Vec::new(),
        }
    }

    pub fn with_codec(mut self, codec: TrackType) -> Self {
        if !self.codecs.contains(&codec) {
            self.codecs.push(codec);
        }
        self
    }

    pub fn with_ssrc(mut self, ssrc: u32) -> Self {
        if !self.ssrcs.contains(&ssrc) {
            self.ssrcs.push(ssrc);
        }
        self
    }
}

/// Immutable session description value
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    pub session_id: u64,
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub fingerprint: Option<Fingerprint>,
    pub media: Vec<MediaSection>,
    pub candidates: Vec<Candidate>,
}

impl SessionDescription {
    /// Parse a description received from the remote peer
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        if lines.next() != Some("v=0") {
            return Err(SdpError::MissingVersion);
        }

        let mut description = SessionDescription {
            session_id: 0,
            ice_ufrag: String::new(),
            ice_pwd: String::new(),
            fingerprint: None,
            media: Vec::new(),
            candidates: Vec::new(),
        };
        let mut section: Option<SectionParser> = None;
        // Set while inside an m= section of a kind we do not carry (e.g. application)
        let mut skipping = false;

        for line in lines {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| SdpError::MalformedLine(line.to_string()))?;

            match key {
                "o" => {
                    description.session_id = value
                        .split_whitespace()
                        .nth(1)
                        .and_then(|id| id.parse().ok())
                        .ok_or_else(|| SdpError::InvalidOrigin(value.to_string()))?;
                }
                "m" => {
                    if let Some(done) = section.take() {
                        description.media.push(done.finish());
                    }
                    section = SectionParser::start(value, description.media.len())?;
                    skipping = section.is_none();
                }
                "a" => {
                    if skipping {
                        continue;
                    }
                    let (name, attr) = value.split_once(':').unwrap_or((value, ""));
                    match name {
                        "ice-ufrag" => description.ice_ufrag = attr.to_string(),
                        "ice-pwd" => description.ice_pwd = attr.to_string(),
                        "fingerprint" => {
                            let (algorithm, digest) = attr
                                .split_once(' ')
                                .ok_or_else(|| SdpError::InvalidAttribute(value.to_string()))?;
                            description.fingerprint = Some(Fingerprint {
                                algorithm: algorithm.to_string(),
                                value: digest.trim().to_string(),
                            });
                        }
                        "candidate" => {
                            // Unreachable kinds (TCP, mDNS hostnames) are left out
                            if let Some(candidate) = Candidate::parse(attr)? {
                                description.candidates.push(candidate);
                            }
                        }
                        _ => {
                            if let Some(current) = section.as_mut() {
                                current.attribute(name, attr, value)?;
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(done) = section.take() {
            description.media.push(done.finish());
        }

        Ok(description)
    }

    /// Stream sources announced by this description, with the first codec
    /// of the section that announced them.
    pub fn ssrc_track_types(&self) -> impl Iterator<Item = (u32, TrackType)> + '_ {
        self.media.iter().flat_map(|section| {
            let codec = section.codecs.first().copied();
            section
                .ssrcs
                .iter()
                .filter_map(move |ssrc| codec.map(|codec| (*ssrc, codec)))
        })
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        write!(out, "v=0\r\n")?;
        write!(out, "o=- {} 2 IN IP4 127.0.0.1\r\n", self.session_id)?;
        write!(out, "s=-\r\nt=0 0\r\n")?;
        if let Some(fingerprint) = &self.fingerprint {
            write!(out, "a=fingerprint:{}\r\n", fingerprint)?;
        }

        if self.media.is_empty() {
            self.write_transport(&mut out)?;
            self.write_candidates(&mut out)?;
            return f.write_str(&out);
        }

        let mids: Vec<&str> = self.media.iter().map(|m| m.mid.as_str()).collect();
        write!(out, "a=group:BUNDLE {}\r\n", mids.join(" "))?;

        for (index, section) in self.media.iter().enumerate() {
            let payload_types: Vec<String> = section
                .codecs
                .iter()
                .map(|c| c.payload_type().to_string())
                .collect();
            write!(
                out,
                "m={} 9 UDP/TLS/RTP/SAVPF {}\r\n",
                section.kind,
                payload_types.join(" ")
            )?;
            write!(out, "c=IN IP4 0.0.0.0\r\n")?;
            write!(out, "a=mid:{}\r\n", section.mid)?;
            self.write_transport(&mut out)?;
            write!(out, "a=sendrecv\r\n")?;

            for codec in &section.codecs {
                write!(
                    out,
                    "a=rtpmap:{} {}/{}",
                    codec.payload_type(),
                    codec.encoding_name(),
                    codec.clock_rate()
                )?;
                if let Some(channels) = codec.channels() {
                    write!(out, "/{}", channels)?;
                }
                write!(out, "\r\n")?;
            }

            for ssrc in &section.ssrcs {
                write!(out, "a=ssrc:{} cname:{}\r\n", ssrc, self.ice_ufrag)?;
            }

            // Bundled: every section shares the first section's transport
            if index == 0 {
                self.write_candidates(&mut out)?;
            }
        }

        f.write_str(&out)
    }
}

impl SessionDescription {
    fn write_transport(&self, out: &mut String) -> fmt::Result {
        write!(out, "a=ice-ufrag:{}\r\n", self.ice_ufrag)?;
        write!(out, "a=ice-pwd:{}\r\n", self.ice_pwd)?;
        write!(out, "a=setup:actpass\r\n")?;
        write!(out, "a=rtcp-mux\r\n")
    }

    fn write_candidates(&self, out: &mut String) -> fmt::Result {
        for candidate in &self.candidates {
            write!(out, "a=candidate:{}\r\n", candidate.to_sdp_value())?;
        }
        write!(out, "a=end-of-candidates\r\n")
    }
}

/// Accumulates one m= section while parsing
struct SectionParser {
    section: MediaSection,
    payload_types: Vec<u8>,
    rtpmap: HashMap<u8, TrackType>,
}

impl SectionParser {
    /// Returns `None` for media kinds this crate does not carry.
    fn start(value: &str, index: usize) -> Result<Option<Self>> {
        let parts: Vec<&str> = value.split_whitespace().collect();
        if parts.len() < 3 {
            return Err(SdpError::InvalidMedia(value.to_string()));
        }
        let Some(kind) = MediaKind::parse(parts[0]) else {
            return Ok(None);
        };

        let payload_types = parts[3..]
            .iter()
            .map(|pt| pt.parse::<u8>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| SdpError::InvalidMedia(value.to_string()))?;

        Ok(Some(Self {
            section: MediaSection::new(kind, index.to_string()),
            payload_types,
            rtpmap: HashMap::new(),
        }))
    }

    fn attribute(&mut self, name: &str, attr: &str, raw: &str) -> Result<()> {
        match name {
            "mid" => self.section.mid = attr.to_string(),
            "rtpmap" => {
                let (pt, encoding) = attr
                    .split_once(' ')
                    .ok_or_else(|| SdpError::InvalidAttribute(raw.to_string()))?;
                let pt: u8 = pt
                    .parse()
                    .map_err(|_| SdpError::InvalidAttribute(raw.to_string()))?;
                let name = encoding.split('/').next().unwrap_or_default();
                if let Some(codec) = TrackType::from_encoding_name(name) {
                    self.rtpmap.insert(pt, codec);
                }
            }
            "ssrc" => {
                let ssrc: u32 = attr
                    .split_whitespace()
                    .next()
                    .and_then(|id| id.parse().ok())
                    .ok_or_else(|| SdpError::InvalidAttribute(raw.to_string()))?;
                if !self.section.ssrcs.contains(&ssrc) {
                    self.section.ssrcs.push(ssrc);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(self) -> MediaSection {
        let SectionParser {
            mut section,
            payload_types,
            rtpmap,
        } = self;

        for pt in payload_types {
            let codec = rtpmap.get(&pt).copied().or_else(|| {
                // Static payload types may appear without an rtpmap
                TrackType::ALL
                    .into_iter()
                    .find(|t| pt < 96 && t.payload_type() == pt)
            });
            if let Some(codec) = codec {
                section = section.with_codec(codec);
            }
        }
        section
    }
}

/// Builder for the local session description
pub struct SessionDescriptionBuilder {
    description: SessionDescription,
}

impl SessionDescriptionBuilder {
    pub fn new(session_id: u64) -> Self {
        Self {
            description: SessionDescription {
                session_id,
                ice_ufrag: String::new(),
                ice_pwd: String::new(),
                fingerprint: None,
                media: Vec::new(),
                candidates: Vec::new(),
            },
        }
    }

    pub fn ice_credentials(mut self, ufrag: &str, pwd: &str) -> Self {
        self.description.ice_ufrag = ufrag.to_string();
        self.description.ice_pwd = pwd.to_string();
        self
    }

    pub fn fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.description.fingerprint = Some(fingerprint);
        self
    }

    pub fn media(mut self, section: MediaSection) -> Self {
        self.description.media.push(section);
        self
    }

    pub fn candidates(mut self, candidates: impl IntoIterator<Item = Candidate>) -> Self {
        self.description.candidates.extend(candidates);
        self
    }

    /// Finish the description. Without any media the offer carries a single
    /// VP8 video section.
    pub fn build(mut self) -> SessionDescription {
        if self.description.media.is_empty() {
            self.description
                .media
                .push(MediaSection::new(MediaKind::Video, "0").with_codec(TrackType::Vp8));
        }
        self.description
    }
}
