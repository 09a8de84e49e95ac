//! Datagram classification and RTP encoding
//!
//! STUN, DTLS and SRTP/SRTCP share one UDP socket per path; the first byte of
//! each datagram tells them apart (RFC 7983).

use bytes::Bytes;
use webrtc::util::marshal::{Marshal, Unmarshal};

use crate::error::{MediaError, Result};

pub use webrtc::rtp::header::Header as RtpHeader;
pub use webrtc::rtp::packet::Packet as RtpPacket;

/// Protocol family of a received datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    Stun,
    Dtls,
    Rtp,
    Rtcp,
    Unknown,
}

pub fn classify(datagram: &[u8]) -> PacketClass {
    match datagram.first() {
        Some(0..=3) => PacketClass::Stun,
        Some(20..=63) => PacketClass::Dtls,
        Some(128..=191) => match datagram.get(1) {
            // RTCP packet types 200-204 fall in the reserved 192-223 range (RFC 5761)
            Some(192..=223) => PacketClass::Rtcp,
            Some(_) => PacketClass::Rtp,
            None => PacketClass::Unknown,
        },
        _ => PacketClass::Unknown,
    }
}

pub fn decode_rtp(datagram: &[u8]) -> Result<RtpPacket> {
    let Some(first) = datagram.first() else {
        return Err(MediaError::Empty);
    };
    if classify(datagram) != PacketClass::Rtp {
        return Err(MediaError::NotRtp(*first));
    }

    let mut buf = datagram;
    RtpPacket::unmarshal(&mut buf).map_err(|e| MediaError::Decode(e.to_string()))
}

pub fn encode_rtp(packet: &RtpPacket) -> Result<Bytes> {
    packet
        .marshal()
        .map_err(|e| MediaError::Encode(e.to_string()))
}
