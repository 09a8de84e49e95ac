//! Media plumbing for Tandem
//!
//! This crate provides the packet-level pieces the peer connection is built on:
//! - First-byte demultiplexing of datagrams sharing one socket (RFC 7983)
//! - RTP decoding and encoding
//! - Bounded, drop-newest delivery channels from a listener to the application
//! - Packetization of outbound track payloads

pub mod error;
pub mod packet;
pub mod stream;
pub mod track;

pub use error::{MediaError, Result};
pub use packet::{PacketClass, RtpPacket, classify, decode_rtp, encode_rtp};
pub use stream::{
    DEFAULT_STREAM_CAPACITY, Delivery, PacketSender, RouteStats, TrackStream, stream_channel,
};
pub use track::Packetizer;
