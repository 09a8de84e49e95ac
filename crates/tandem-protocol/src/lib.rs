//! Shared protocol types for Tandem
//!
//! Media classification, candidate descriptors, the session description
//! exchanged between peers and the signaling envelope that carries it.

pub mod messages;
pub mod sdp;
pub mod types;

pub use messages::SignalMessage;
pub use sdp::{Fingerprint, MediaSection, SdpError, SessionDescription, SessionDescriptionBuilder};
pub use types::{Candidate, MediaKind, TrackType};
