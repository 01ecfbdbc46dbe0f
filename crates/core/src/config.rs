use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MIB: u64 = 1024 * 1024;

/// Tunables of the object manager. Passed explicitly at construction; there
/// is no process-wide configuration state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObjectManagerConfig {
    /// Upper bound, in bytes, on the space taken by cached objects plus
    /// collapsed snapshots.
    pub cache_size: u64,
    /// Rate constant (per second) of the exponential reuse-probability decay
    /// used by eviction scoring.
    pub eviction_decay: f64,
    /// Objects smaller than this are scored as if they had this size, to
    /// model per-object retrieval latency dominating bandwidth.
    pub eviction_floor: u64,
    /// A delta chain requested more than this many times within the lookback
    /// window gets collapsed into a cached snapshot.
    pub promote_threshold: u64,
    /// Window for counting recent materialization requests.
    #[serde(with = "duration_secs")]
    pub promote_lookback: Duration,
    /// Max concurrency of payload transfers.
    pub pool_size: usize,
    /// Unready cache entries older than this are treated as crash leftovers
    /// and swept by eviction.
    #[serde(with = "duration_secs")]
    pub stale_claim_grace: Duration,
}

impl Default for ObjectManagerConfig {
    fn default() -> Self {
        ObjectManagerConfig {
            cache_size: 10 * 1024 * MIB,
            eviction_decay: 0.002,
            eviction_floor: MIB,
            promote_threshold: 5,
            promote_lookback: Duration::from_secs(300),
            pool_size: 8,
            stale_claim_grace: Duration::from_secs(600),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cache_size must be positive")]
    ZeroCacheSize,
    #[error("eviction_decay must be finite and non-negative")]
    BadDecay,
    #[error("pool_size must be positive")]
    ZeroPoolSize,
}

impl ObjectManagerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_size == 0 {
            return Err(ConfigError::ZeroCacheSize);
        }
        if !self.eviction_decay.is_finite() || self.eviction_decay < 0.0 {
            return Err(ConfigError::BadDecay);
        }
        if self.pool_size == 0 {
            return Err(ConfigError::ZeroPoolSize);
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
