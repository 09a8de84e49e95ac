//! Session identifiers and secrets
//!
//! All randomness for a peer connection flows through one [`RandomSource`] so
//! tests can substitute a seeded generator.

use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// ICE username fragment length
pub const UFRAG_LEN: usize = 16;
/// ICE password length
pub const PWD_LEN: usize = 32;

type BoxedRng = Box<dyn RngCore + Send>;

/// Generated once per session, never rotated
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("ufrag", &self.ufrag)
            .field("pwd", &"<redacted>")
            .finish()
    }
}

/// Injectable random source shared by the generator and the listener fan-out
pub struct RandomSource {
    rng: Mutex<BoxedRng>,
}

impl RandomSource {
    pub fn from_entropy() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Deterministic source for tests
    pub fn seeded(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    pub fn from_rng(rng: impl RngCore + Send + 'static) -> Self {
        Self {
            rng: Mutex::new(Box::new(rng)),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut BoxedRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut rng)
    }

    /// Characters safe in any SDP attribute value
    pub fn ice_string(&self, len: usize) -> String {
        self.with(|rng| {
            (0..len)
                .map(|_| char::from(rng.sample(Alphanumeric)))
                .collect()
        })
    }

    pub fn credentials(&self) -> SessionCredentials {
        SessionCredentials {
            ufrag: self.ice_string(UFRAG_LEN),
            pwd: self.ice_string(PWD_LEN),
        }
    }

    /// Base candidate priority for `paths` enumerated paths.
    ///
    /// Drawn from `[paths, 65535]` so counting down once per bound path never
    /// reaches zero.
    pub fn priority_base(&self, paths: usize) -> u32 {
        let low = paths.clamp(1, u16::MAX as usize) as u32;
        self.with(|rng| rng.gen_range(low..=u16::MAX as u32))
    }

    pub fn ssrc(&self) -> u32 {
        self.with(|rng| rng.next_u32())
    }

    pub fn sequence_start(&self) -> u16 {
        self.with(|rng| rng.gen_range(0..=u16::MAX))
    }

    pub fn timestamp_start(&self) -> u32 {
        self.with(|rng| rng.next_u32())
    }

    /// Origin session id; kept below 2^63 (RFC 4566)
    pub fn session_id(&self) -> u64 {
        self.with(|rng| rng.next_u64() >> 1)
    }
}

impl Default for RandomSource {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl fmt::Debug for RandomSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RandomSource").finish_non_exhaustive()
    }
}
