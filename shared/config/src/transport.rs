//! Transport configuration

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Options recognised by broker-backed transports.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TransportSettings {
    /// Spawn the inbound receive loop on connect
    #[serde(default = "default_auto_subscribe")]
    pub auto_subscribe: bool,

    /// Routing-key exchange component for the queue transport
    #[validate(length(min = 1))]
    #[serde(default = "default_exchange")]
    pub exchange: String,

    /// Namespace prefix for backend queue names
    #[validate(length(min = 1))]
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,

    /// Shared-queue identity for consumer-group load balancing
    #[validate(length(min = 1))]
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Maximum reconnect attempts before a receive loop gives up
    #[validate(range(min = 1, max = 100))]
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    /// Delay between reconnect attempts in milliseconds
    #[validate(range(min = 10))]
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Backend connection pool size
    #[validate(range(min = 1, max = 1000))]
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Bounded wait for a pooled connection in milliseconds
    #[validate(range(min = 1))]
    #[serde(default = "default_pool_timeout_ms")]
    pub pool_timeout_ms: u64,
}

fn default_auto_subscribe() -> bool {
    true
}

fn default_exchange() -> String {
    "smartmessage".to_string()
}

fn default_queue_prefix() -> String {
    "smartmessage".to_string()
}

fn default_consumer_group() -> String {
    "default".to_string()
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_pool_size() -> usize {
    10
}

fn default_pool_timeout_ms() -> u64 {
    5000
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            auto_subscribe: default_auto_subscribe(),
            exchange: default_exchange(),
            queue_prefix: default_queue_prefix(),
            consumer_group: default_consumer_group(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            pool_size: default_pool_size(),
            pool_timeout_ms: default_pool_timeout_ms(),
        }
    }
}
