//! Delivery channels from a path listener to the application
//!
//! Each observed stream source gets one bounded channel. The listener side
//! never waits: when the channel is full the newest packet is dropped and
//! counted, so a slow consumer cannot stall the socket shared by every other
//! source on that path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tandem_protocol::TrackType;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::packet::RtpPacket;

/// Packets buffered per stream before drops start (absorbs scheduling jitter)
pub const DEFAULT_STREAM_CAPACITY: usize = 15;

/// Outcome of handing one packet to a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Channel full, packet discarded
    Dropped,
    /// Application closed or dropped its end
    Closed,
}

/// Per-stream delivery counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteStats {
    pub ssrc: u32,
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Write side of a stream, held by the router and the listeners
#[derive(Debug, Clone)]
pub struct PacketSender {
    ssrc: u32,
    track_type: TrackType,
    tx: mpsc::Sender<RtpPacket>,
    counters: Arc<Counters>,
}

impl PacketSender {
    /// Hand a packet to the stream without waiting
    pub fn deliver(&self, packet: RtpPacket) -> Delivery {
        match self.tx.try_send(packet) {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                Delivery::Delivered
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::trace!(
                    ssrc = self.ssrc,
                    dropped,
                    "Stream channel full, dropping newest packet"
                );
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn track_type(&self) -> TrackType {
        self.track_type
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn stats(&self) -> RouteStats {
        self.counters.snapshot(self.ssrc)
    }
}

/// Read side of a stream, handed to the application's track handler.
///
/// Dropping it (or calling [`TrackStream::close`]) ends the stream.
#[derive(Debug)]
pub struct TrackStream {
    ssrc: u32,
    track_type: TrackType,
    rx: mpsc::Receiver<RtpPacket>,
    counters: Arc<Counters>,
}

impl TrackStream {
    /// Next packet, or `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<RtpPacket> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RtpPacket> {
        self.rx.try_recv().ok()
    }

    pub fn close(&mut self) {
        self.rx.close();
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn track_type(&self) -> TrackType {
        self.track_type
    }

    /// Packets discarded because this stream was not read fast enough
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> RouteStats {
        self.counters.snapshot(self.ssrc)
    }
}

impl Counters {
    fn snapshot(&self, ssrc: u32) -> RouteStats {
        RouteStats {
            ssrc,
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Create the channel pair for one stream source
pub fn stream_channel(
    ssrc: u32,
    track_type: TrackType,
    capacity: usize,
) -> (PacketSender, TrackStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let counters = Arc::new(Counters::default());

    (
        PacketSender {
            ssrc,
            track_type,
            tx,
            counters: counters.clone(),
        },
        TrackStream {
            ssrc,
            track_type,
            rx,
            counters,
        },
    )
}
