//! Outbound RTP framing for locally added tracks

use bytes::Bytes;
use tandem_protocol::TrackType;

use crate::packet::{RtpHeader, RtpPacket};

/// Frames sent per second, used to advance the RTP timestamp
const FRAME_RATE: u32 = 50;

/// Wraps application payloads into RTP packets for a single source
#[derive(Debug, Clone)]
pub struct Packetizer {
    ssrc: u32,
    track_type: TrackType,
    sequence_number: u16,
    timestamp: u32,
}

impl Packetizer {
    pub fn new(ssrc: u32, track_type: TrackType) -> Self {
        Self {
            ssrc,
            track_type,
            sequence_number: 0,
            timestamp: 0,
        }
    }

    /// Start from a given sequence number and timestamp (random starts per RFC 3550)
    pub fn with_start(mut self, sequence_number: u16, timestamp: u32) -> Self {
        self.sequence_number = sequence_number;
        self.timestamp = timestamp;
        self
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn track_type(&self) -> TrackType {
        self.track_type
    }

    pub fn packetize(&mut self, payload: Bytes) -> RtpPacket {
        let packet = RtpPacket {
            header: RtpHeader {
                version: 2,
                marker: true,
                payload_type: self.track_type.payload_type(),
                sequence_number: self.sequence_number,
                timestamp: self.timestamp,
                ssrc: self.ssrc,
                ..Default::default()
            },
            payload,
        };

        self.sequence_number = self.sequence_number.wrapping_add(1);
        self.timestamp = self
            .timestamp
            .wrapping_add(self.track_type.clock_rate() / FRAME_RATE);
        packet
    }
}
