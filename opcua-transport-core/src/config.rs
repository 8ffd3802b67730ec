//! Local capacity knobs for the transport layer, deserialized the way the teacher's
//! `ClientConfig`/`ServerConfig` are: `serde` plus `serde_yaml`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Local capacity limits applied during HELLO/ACK negotiation and chunk encoding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub max_chunk_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
    pub channel_lifetime_ms: u32,
    #[serde(with = "duration_millis")]
    pub hello_timeout: Duration,
    pub security_token_renewal_fraction: f32,
    pub previous_token_grace_fraction: f32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 65535,
            max_message_size: 2_097_152,
            max_chunk_count: 65535,
            channel_lifetime_ms: 3_600_000,
            hello_timeout: Duration::from_secs(5),
            security_token_renewal_fraction: 0.75,
            previous_token_grace_fraction: 0.25,
        }
    }
}

/// Exponential backoff parameters for the client connection FSM's reconnect loop and the
/// stale-channel single-retry path, grounded on `opcua_client::session::retry`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionRetryPolicy {
    pub max_retries: Option<u32>,
    #[serde(with = "duration_millis")]
    pub retry_interval: Duration,
    pub backoff_multiplier: f64,
    #[serde(with = "duration_millis")]
    pub max_retry_interval: Duration,
}

impl Default for SessionRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            retry_interval: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_retry_interval: Duration::from_secs(30),
        }
    }
}

impl SessionRetryPolicy {
    /// A policy allowing exactly one retry, used to implement the FSM's single
    /// stale-channel retry without reusing the reconnect-forever policy.
    pub fn single_retry() -> Self {
        Self {
            max_retries: Some(1),
            ..Default::default()
        }
    }

    pub fn new_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            policy: *self,
            attempt: 0,
        }
    }
}

/// An iterator of successive retry delays, `None` once `max_retries` is exhausted.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    policy: SessionRetryPolicy,
    attempt: u32,
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_retries {
            if self.attempt >= max {
                return None;
            }
        }
        let factor = self.policy.backoff_multiplier.powi(self.attempt as i32);
        let delay = self.policy.retry_interval.mul_f64(factor).min(self.policy.max_retry_interval);
        self.attempt += 1;
        Some(delay)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_constants() {
        let config = TransportConfig::default();
        assert_eq!(config.max_chunk_size, 65535);
        assert_eq!(config.max_message_size, 2_097_152);
    }

    #[test]
    fn round_trips_through_yaml() {
        let config = TransportConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let decoded: TransportConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn single_retry_policy_yields_exactly_one_delay() {
        let policy = SessionRetryPolicy::single_retry();
        let delays: Vec<_> = policy.new_backoff().collect();
        assert_eq!(delays.len(), 1);
    }

    #[test]
    fn unlimited_policy_keeps_backing_off_up_to_the_configured_ceiling() {
        let policy = SessionRetryPolicy::default();
        let mut backoff = policy.new_backoff();
        let first = backoff.next().unwrap();
        let second = backoff.next().unwrap();
        assert!(second >= first);
        assert!(second <= policy.max_retry_interval);
    }
}
