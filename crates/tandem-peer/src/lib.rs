//! Tandem peer library
//!
//! Establishes a peer-to-peer media session: enumerates local paths, binds a
//! listener on each, produces the local session description and routes
//! inbound packets by stream source to application handlers.

pub mod config;
pub mod credentials;
pub mod dtls;
pub mod error;
pub mod ice;
pub mod peer;
pub mod transport;

pub use crate::config::{BindPolicy, Config};
pub use crate::error::{PathBindFailure, PeerError, Result};
pub use crate::peer::{Offer, PeerConnection, PeerState};
