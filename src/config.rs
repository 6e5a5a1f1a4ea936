use std::time::Duration;

use crate::{GatewayError, Result};

/// Default number of sender worker queues.
pub const DEFAULT_SENDER_QUEUES: usize = 8;

/// Default grace window for disconnected clients (seconds).
pub const DEFAULT_GRACE_WINDOW_SECS: u64 = 60;

/// Default response timeout (seconds).
pub const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 30;

/// Reply-route entries live this many response timeouts before expiring.
pub const ROUTE_TTL_FACTOR: u32 = 5;

/// Default cap on how many consecutive intake items a sender worker groups
/// into one batched send.
pub const DEFAULT_MAX_SEND_BATCH: usize = 16;

/// Default upper bound for a single serialized frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Configuration for the gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Number of sender worker queues. All traffic for one client funnels
    /// through the worker its state was pinned to at creation.
    pub gateway_sender_queues: usize,
    /// How long a disconnected client is retained before it is dropped.
    pub grace_window: Duration,
    /// Response timeout; the reply-route TTL derives from it.
    pub response_timeout: Duration,
    /// Maximum consecutive same-client intake items grouped into one batch.
    pub max_send_batch: usize,
    /// Maximum size of a single serialized frame.
    pub max_frame_size: usize,
}

impl GatewayConfig {
    /// TTL for reply-route cache entries.
    pub fn route_ttl(&self) -> Duration {
        self.response_timeout * ROUTE_TTL_FACTOR
    }

    /// Validate the configuration before the gateway starts.
    pub fn validate(&self) -> Result<()> {
        if self.gateway_sender_queues == 0 {
            return Err(GatewayError::InvalidConfig(
                "gateway_sender_queues must be at least 1".to_string(),
            ));
        }
        if self.max_send_batch == 0 {
            return Err(GatewayError::InvalidConfig(
                "max_send_batch must be at least 1".to_string(),
            ));
        }
        if self.grace_window.is_zero() {
            return Err(GatewayError::InvalidConfig(
                "grace_window must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway_sender_queues: DEFAULT_SENDER_QUEUES,
            grace_window: Duration::from_secs(DEFAULT_GRACE_WINDOW_SECS),
            response_timeout: Duration::from_secs(DEFAULT_RESPONSE_TIMEOUT_SECS),
            max_send_batch: DEFAULT_MAX_SEND_BATCH,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();

        assert_eq!(config.gateway_sender_queues, DEFAULT_SENDER_QUEUES);
        assert_eq!(config.grace_window, Duration::from_secs(60));
        assert_eq!(config.response_timeout, Duration::from_secs(30));
        assert_eq!(config.max_send_batch, DEFAULT_MAX_SEND_BATCH);
        assert_eq!(config.max_frame_size, 10 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_route_ttl_derives_from_response_timeout() {
        let config = GatewayConfig {
            response_timeout: Duration::from_secs(4),
            ..Default::default()
        };
        assert_eq!(config.route_ttl(), Duration::from_secs(20));
    }

    #[test]
    fn test_validate_rejects_zero_senders() {
        let config = GatewayConfig {
            gateway_sender_queues: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_batch_and_grace() {
        let config = GatewayConfig {
            max_send_batch: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = GatewayConfig {
            grace_window: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_custom_config() {
        let config = GatewayConfig {
            gateway_sender_queues: 3,
            grace_window: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(config.gateway_sender_queues, 3);
        assert_eq!(config.grace_window, Duration::from_millis(100));
        // Other fields keep their defaults.
        assert_eq!(config.response_timeout, Duration::from_secs(30));
    }
}
