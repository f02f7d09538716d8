use crate::error::ShardError;

/// Maximum serialized size of one oplog entry before a write is chained.
pub const MAX_OPLOG_ENTRY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// fsync the oplog before every append returns.
    Full,
    /// Leave flushing to the OS page cache.
    OsBuffered,
}

/// Runtime configuration shared by every shard, router and migration of a cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub durability_mode: DurabilityMode,
    pub max_oplog_entry_bytes: usize,
    /// Bytes of each chained link left for the entry envelope around the fragment.
    pub chain_envelope_reserve_bytes: usize,
    pub critical_section_timeout_ms: u64,
    /// How long a write parked behind a critical section waits before failing
    /// with a retryable error.
    pub write_block_timeout_ms: u64,
    pub catch_up_max_rounds: usize,
    pub session_fetch_batch_size: usize,
    pub session_pump_idle_ms: u64,
    pub router_max_stale_retries: usize,
    pub replicated_record_ids_enabled: bool,
    pub pool_hard_cap: Option<u64>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            durability_mode: DurabilityMode::Full,
            max_oplog_entry_bytes: MAX_OPLOG_ENTRY_BYTES,
            chain_envelope_reserve_bytes: 16 * 1024,
            critical_section_timeout_ms: 30_000,
            write_block_timeout_ms: 60_000,
            catch_up_max_rounds: 64,
            session_fetch_batch_size: 256,
            session_pump_idle_ms: 20,
            router_max_stale_retries: 8,
            replicated_record_ids_enabled: false,
            pool_hard_cap: None,
        }
    }
}

impl ClusterConfig {
    pub fn production() -> Self {
        Self {
            durability_mode: DurabilityMode::Full,
            ..Self::default()
        }
    }

    pub fn development() -> Self {
        Self {
            durability_mode: DurabilityMode::OsBuffered,
            ..Self::default()
        }
    }

    /// Short timeouts and a fast session pump for tests.
    pub fn testing() -> Self {
        Self {
            durability_mode: DurabilityMode::OsBuffered,
            critical_section_timeout_ms: 5_000,
            write_block_timeout_ms: 10_000,
            session_pump_idle_ms: 2,
            ..Self::default()
        }
    }

    pub fn sync_on_append(&self) -> bool {
        matches!(self.durability_mode, DurabilityMode::Full)
    }

    /// Payload bytes one chained link may carry.
    pub fn chain_fragment_bytes(&self) -> usize {
        self.max_oplog_entry_bytes
            .saturating_sub(self.chain_envelope_reserve_bytes)
    }

    pub fn validate(&self) -> Result<(), ShardError> {
        if self.max_oplog_entry_bytes == 0 {
            return Err(ShardError::InvalidConfig {
                message: "max_oplog_entry_bytes must be > 0".into(),
            });
        }
        if self.chain_envelope_reserve_bytes >= self.max_oplog_entry_bytes {
            return Err(ShardError::InvalidConfig {
                message: "chain_envelope_reserve_bytes must be smaller than max_oplog_entry_bytes"
                    .into(),
            });
        }
        if self.catch_up_max_rounds == 0 {
            return Err(ShardError::InvalidConfig {
                message: "catch_up_max_rounds must be > 0".into(),
            });
        }
        if self.session_fetch_batch_size == 0 {
            return Err(ShardError::InvalidConfig {
                message: "session_fetch_batch_size must be > 0".into(),
            });
        }
        if self.critical_section_timeout_ms == 0 || self.write_block_timeout_ms == 0 {
            return Err(ShardError::InvalidConfig {
                message: "critical section timeouts must be > 0".into(),
            });
        }
        if self.pool_hard_cap == Some(0) {
            return Err(ShardError::InvalidConfig {
                message: "pool_hard_cap must be > 0 when set".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ClusterConfig, DurabilityMode, MAX_OPLOG_ENTRY_BYTES};

    #[test]
    fn default_config_is_valid_and_durable() {
        let config = ClusterConfig::default();
        config.validate().expect("valid");
        assert_eq!(config.durability_mode, DurabilityMode::Full);
        assert_eq!(config.max_oplog_entry_bytes, MAX_OPLOG_ENTRY_BYTES);
        assert!(config.chain_fragment_bytes() < MAX_OPLOG_ENTRY_BYTES);
    }

    #[test]
    fn reserve_larger_than_entry_limit_is_rejected() {
        let config = ClusterConfig {
            max_oplog_entry_bytes: 1024,
            chain_envelope_reserve_bytes: 1024,
            ..ClusterConfig::testing()
        };
        let err = config.validate().expect_err("invalid");
        assert_eq!(err.code_str(), "invalid_config");
    }

    #[test]
    fn zero_pool_cap_is_rejected() {
        let config = ClusterConfig {
            pool_hard_cap: Some(0),
            ..ClusterConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
