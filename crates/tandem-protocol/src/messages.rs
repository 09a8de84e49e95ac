use serde::{Deserialize, Serialize};

/// Envelope for session descriptions exchanged out-of-band
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Local offer
    Offer { sdp: String },

    /// Remote answer
    Answer { sdp: String },
}

impl SignalMessage {
    pub fn sdp(&self) -> &str {
        match self {
            SignalMessage::Offer { sdp } | SignalMessage::Answer { sdp } => sdp,
        }
    }
}
