//! Object ids
//!
//! An [`ObjectId`] is 12 bytes:
//! - 4-byte big-endian seconds since the Unix epoch
//! - 5 random bytes fixed per generator
//! - 3-byte big-endian counter
//!
//! Ids from one generator sort by creation time, then by counter. There is no
//! process-wide state: each [`OidGenerator`] owns its random value and
//! counter, and a seeded generator is fully deterministic.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};

const COUNTER_MASK: u32 = 0x00FF_FFFF;

/// 12-byte document id
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectId([u8; ObjectId::SIZE]);

impl ObjectId {
    /// Size in bytes
    pub const SIZE: usize = 12;

    /// Wrap raw bytes
    pub const fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        ObjectId(bytes)
    }

    /// All-zero id
    pub const fn null() -> Self {
        ObjectId([0; Self::SIZE])
    }

    /// All-ones id
    pub const fn max() -> Self {
        ObjectId([0xFF; Self::SIZE])
    }

    /// True for the all-zero id
    pub fn is_null(&self) -> bool {
        *self == Self::null()
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.0
    }

    /// Creation time in seconds since the epoch
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Counter component
    pub fn counter(&self) -> u32 {
        u32::from_be_bytes([0, self.0[9], self.0[10], self.0[11]])
    }

    /// Parse 24 hex digits
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != Self::SIZE * 2 || !hex.is_ascii() {
            return Err(Error::InvalidObjectId(hex.to_string()));
        }
        let mut bytes = [0u8; Self::SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidObjectId(hex.to_string()))?;
        }
        Ok(ObjectId(bytes))
    }

    /// Lowercase hex form
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

/// Generator of [`ObjectId`]s
#[derive(Debug, Clone)]
pub struct OidGenerator {
    random: [u8; 5],
    counter: u32,
    fixed_timestamp: Option<u32>,
}

impl Default for OidGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl OidGenerator {
    /// Generator seeded from the OS entropy source
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Deterministic generator
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(mut rng: StdRng) -> Self {
        OidGenerator {
            random: rng.gen(),
            counter: rng.gen::<u32>() & COUNTER_MASK,
            fixed_timestamp: None,
        }
    }

    /// Stamp every id with `seconds` instead of the wall clock
    pub fn with_timestamp(mut self, seconds: u32) -> Self {
        self.fixed_timestamp = Some(seconds);
        self
    }

    /// Next id
    pub fn generate(&mut self) -> ObjectId {
        let seconds = self
            .fixed_timestamp
            .unwrap_or_else(|| Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32);
        self.counter = (self.counter + 1) & COUNTER_MASK;

        let mut bytes = [0u8; ObjectId::SIZE];
        bytes[..4].copy_from_slice(&seconds.to_be_bytes());
        bytes[4..9].copy_from_slice(&self.random);
        bytes[9..].copy_from_slice(&self.counter.to_be_bytes()[1..]);
        ObjectId(bytes)
    }
}
