//! Peer connection orchestrator
//!
//! Drives credential generation, per-path listener fan-out and description
//! assembly, and routes inbound streams to the application.

mod connection;
mod router;

pub use connection::{Offer, PeerConnection, PeerConnectionBuilder, PeerState};
pub use router::{
    FixedClassifier, NegotiatedClassifier, OnTrackHdlrFn, StreamRouter, TrackClassifier,
    TrackHandlerFuture, track_handler,
};
