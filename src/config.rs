//! Node configuration.
//!
//! Everything the routing table and the lookup need to know about the overlay
//! shape lives in [`DhtConfig`]. Values can be built in code, deserialized from
//! TOML, or mixed: the binary loads an optional file and lets CLI flags
//! override individual fields.

use std::path::Path;

use serde::Deserialize;
use tokio::time::Duration;

use crate::error::DhtError;

/// Default identifier width in bits.
pub const DEFAULT_ID_BITS: usize = 64;

/// Default bucket capacity (Kademlia `k`).
pub const DEFAULT_K: usize = 20;

/// Default number of concurrent peer queries per lookup round (Kademlia `α`).
pub const DEFAULT_ALPHA: usize = 3;

/// Widest identifier the [`crate::NodeId`] container can hold.
pub const MAX_ID_BITS: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Identifier width in bits. Must be a multiple of 8 in `8..=256`.
    pub id_bits: usize,
    /// Bucket capacity, also the size of lookup results.
    pub k: usize,
    /// Upper bound on in-flight peer queries within one lookup round.
    pub alpha: usize,
    /// Liveness probe budget during eviction, in milliseconds.
    pub probe_timeout_ms: u64,
    /// Budget for a single FIND_NODE query, in milliseconds.
    pub query_timeout_ms: u64,
    /// Budget for establishing an outbound connection, in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            id_bits: DEFAULT_ID_BITS,
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            probe_timeout_ms: 500,
            query_timeout_ms: 2_000,
            connect_timeout_ms: 2_000,
        }
    }
}

impl DhtConfig {
    /// Parse a configuration from TOML. Missing keys keep their defaults.
    pub fn from_toml_str(input: &str) -> Result<Self, DhtError> {
        let config: Self =
            toml::from_str(input).map_err(|err| DhtError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DhtError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            DhtError::InvalidConfig(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), DhtError> {
        if self.id_bits == 0 || self.id_bits > MAX_ID_BITS || self.id_bits % 8 != 0 {
            return Err(DhtError::InvalidConfig(format!(
                "id_bits must be a multiple of 8 between 8 and {MAX_ID_BITS}, got {}",
                self.id_bits
            )));
        }
        if self.k == 0 {
            return Err(DhtError::InvalidConfig("k must be at least 1".into()));
        }
        if self.alpha == 0 {
            return Err(DhtError::InvalidConfig("alpha must be at least 1".into()));
        }
        if self.probe_timeout_ms == 0 || self.query_timeout_ms == 0 {
            return Err(DhtError::InvalidConfig(
                "probe and query timeouts must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
