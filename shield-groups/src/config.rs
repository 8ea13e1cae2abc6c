//! Runtime configuration for the group core.
//!
//! Every knob has a default suitable for a phone on an anonymity network;
//! embedders override through JSON or by constructing the struct.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crdt::apply::HoldLimits;
use crate::crdt::limits::MAX_OPS_PER_SNAPSHOT;
use crate::crdt::policy::PolicyKind;
use crate::crypto::encryption::KdfParams;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid config: {0}")]
    Invalid(String),
    #[error("Config parse error: {0}")]
    Parse(String),
}

/// Exponential backoff: `min(base * 2^attempts, cap)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl RetryPolicy {
    /// Delay before the next try after `attempts` failures.
    pub fn delay_ms(&self, attempts: u32) -> u64 {
        let factor = 1u64 << attempts.min(30);
        self.base_ms.saturating_mul(factor).min(self.cap_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Authorization policy. Must match across all replicas of a group.
    pub policy: PolicyKind,

    /// Release passes a held op survives before it is dropped.
    pub hold_max_attempts: u32,
    /// Max time an op may wait for missing predecessors.
    pub hold_max_age_ms: u64,
    /// Max held ops per group.
    pub max_held_ops: usize,
    /// Max messages per group waiting for their sender's membership.
    pub max_held_messages: usize,

    /// Groups whose snapshot chunks may be buffered before the join
    /// completes. The oldest is evicted when full.
    pub max_pending_joins: usize,
    /// Max ops buffered for one pending join.
    pub max_pending_join_ops: usize,
    /// Ops per outgoing snapshot chunk.
    pub snapshot_chunk_ops: usize,

    /// Outbound op/message delivery retry.
    pub delivery_retry: RetryPolicy,
    /// Group key re-delivery retry.
    pub key_retry: RetryPolicy,
    /// Queued sends older than this are given up on.
    pub delivery_max_age_ms: u64,

    /// Recently seen inbound payloads remembered for dedup.
    pub dedupe_cache_size: usize,
    /// Buffered UI events per subscriber.
    pub event_channel_capacity: usize,
    /// Outbox flush tick.
    pub flush_interval_ms: u64,

    /// Argon2id cost for the at-rest group key copy.
    pub vault_kdf: KdfParams,

    /// Display label for this device in invites.
    pub device_label: String,
}

impl Default for GroupConfig {
    fn default() -> Self {
        GroupConfig {
            policy: PolicyKind::Open,
            hold_max_attempts: 64,
            hold_max_age_ms: 10 * 60 * 1000,
            max_held_ops: 1_024,
            max_held_messages: 256,
            max_pending_joins: 4,
            max_pending_join_ops: 8 * MAX_OPS_PER_SNAPSHOT,
            snapshot_chunk_ops: MAX_OPS_PER_SNAPSHOT,
            delivery_retry: RetryPolicy {
                base_ms: 5_000,
                cap_ms: 60 * 60 * 1000,
            },
            key_retry: RetryPolicy {
                base_ms: 10_000,
                cap_ms: 30 * 60 * 1000,
            },
            delivery_max_age_ms: 7 * 24 * 60 * 60 * 1000,
            dedupe_cache_size: 4_096,
            event_channel_capacity: 256,
            flush_interval_ms: 2_000,
            vault_kdf: KdfParams::default(),
            device_label: String::new(),
        }
    }
}

impl GroupConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: GroupConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hold_max_attempts == 0 {
            return Err(ConfigError::Invalid("hold_max_attempts must be > 0".into()));
        }
        if self.hold_max_age_ms == 0 {
            return Err(ConfigError::Invalid("hold_max_age_ms must be > 0".into()));
        }
        if self.max_held_ops == 0 {
            return Err(ConfigError::Invalid("max_held_ops must be > 0".into()));
        }
        if self.max_held_messages == 0 {
            return Err(ConfigError::Invalid("max_held_messages must be > 0".into()));
        }
        if self.max_pending_joins == 0 || self.max_pending_join_ops == 0 {
            return Err(ConfigError::Invalid(
                "pending join limits must be > 0".into(),
            ));
        }
        if self.snapshot_chunk_ops == 0 || self.snapshot_chunk_ops > MAX_OPS_PER_SNAPSHOT {
            return Err(ConfigError::Invalid(format!(
                "snapshot_chunk_ops must be in 1..={MAX_OPS_PER_SNAPSHOT}"
            )));
        }
        if self.delivery_max_age_ms == 0 {
            return Err(ConfigError::Invalid("delivery_max_age_ms must be > 0".into()));
        }
        for (name, retry) in [
            ("delivery_retry", &self.delivery_retry),
            ("key_retry", &self.key_retry),
        ] {
            if retry.base_ms == 0 || retry.cap_ms < retry.base_ms {
                return Err(ConfigError::Invalid(format!(
                    "{name}: need 0 < base_ms <= cap_ms"
                )));
            }
        }
        if self.dedupe_cache_size == 0 {
            return Err(ConfigError::Invalid("dedupe_cache_size must be > 0".into()));
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_channel_capacity must be > 0".into(),
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid("flush_interval_ms must be > 0".into()));
        }
        if self.device_label.len() > crate::crdt::limits::MAX_DEVICE_LABEL_BYTES {
            return Err(ConfigError::Invalid("device_label too long".into()));
        }
        Ok(())
    }

    pub fn hold_limits(&self) -> HoldLimits {
        HoldLimits {
            max_attempts: self.hold_max_attempts,
            max_age_ms: self.hold_max_age_ms,
            max_held: self.max_held_ops,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        GroupConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = GroupConfig::from_json_str(r#"{"policy":"admin","max_held_ops":8}"#).unwrap();
        assert_eq!(config.policy, PolicyKind::Admin);
        assert_eq!(config.max_held_ops, 8);
        assert_eq!(config.hold_max_attempts, 64);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = GroupConfig::from_json_str(r#"{"dedupe_cache_size":0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = GroupConfig::from_json_str("not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = GroupConfig::from_json_str(r#"{"snapshot_chunk_ops":4096}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let mut config = GroupConfig::default();
        config.key_retry = RetryPolicy {
            base_ms: 10,
            cap_ms: 5,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_sequence() {
        let retry = RetryPolicy {
            base_ms: 1_000,
            cap_ms: 10_000,
        };
        assert_eq!(retry.delay_ms(0), 1_000);
        assert_eq!(retry.delay_ms(1), 2_000);
        assert_eq!(retry.delay_ms(3), 8_000);
        assert_eq!(retry.delay_ms(4), 10_000);
        assert_eq!(retry.delay_ms(u32::MAX), 10_000);
    }
}
