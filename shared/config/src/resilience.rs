//! Deduplication, circuit breaker, and dead-letter queue configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Storage backing for a deduplication queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DdqStorage {
    /// In-process ring buffer plus hash set
    Memory,
    /// Backend list plus backend set under a shared key prefix
    Distributed,
}

/// Deduplication queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DdqSettings {
    /// Gate dispatcher routing on deduplication
    #[serde(default = "default_ddq_enabled")]
    pub enabled: bool,

    /// Bounded capacity of the UUID set; zero disables retention
    #[serde(default = "default_ddq_size")]
    pub size: u32,

    /// Where the UUID set lives
    #[serde(default = "default_ddq_storage")]
    pub storage: DdqStorage,
}

fn default_ddq_enabled() -> bool {
    true
}

fn default_ddq_size() -> u32 {
    100
}

fn default_ddq_storage() -> DdqStorage {
    DdqStorage::Memory
}

impl Default for DdqSettings {
    fn default() -> Self {
        Self {
            enabled: default_ddq_enabled(),
            size: default_ddq_size(),
            storage: default_ddq_storage(),
        }
    }
}

/// Fallback invoked when a circuit rejects an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackPolicy {
    /// Route the envelope to the dead-letter queue
    Dlq,
    /// Degrade with a predefined response value
    Degrade,
    /// Retry with bounded exponential backoff
    Retry,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CircuitSettings {
    /// Consecutive failures within the window before the circuit opens
    #[validate(range(min = 1, max = 10000))]
    #[serde(default = "default_circuit_threshold")]
    pub threshold: u32,

    /// Failure-counting window in milliseconds
    #[validate(range(min = 100))]
    #[serde(default = "default_circuit_window_ms")]
    pub window_ms: u64,

    /// Time an open circuit waits before a half-open trial, in milliseconds
    #[validate(range(min = 100))]
    #[serde(default = "default_circuit_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Fallback policy when the circuit is open
    #[serde(default = "default_circuit_fallback")]
    pub fallback: FallbackPolicy,

    /// Retry configuration used by the retry fallback
    #[validate(nested)]
    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_circuit_threshold() -> u32 {
    5
}

fn default_circuit_window_ms() -> u64 {
    60_000
}

fn default_circuit_cooldown_ms() -> u64 {
    30_000
}

fn default_circuit_fallback() -> FallbackPolicy {
    FallbackPolicy::Dlq
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            threshold: default_circuit_threshold(),
            window_ms: default_circuit_window_ms(),
            cooldown_ms: default_circuit_cooldown_ms(),
            fallback: default_circuit_fallback(),
            retry: RetrySettings::default(),
        }
    }
}

/// Bounded exponential backoff for retried operations.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RetrySettings {
    /// Maximum retry attempts
    #[validate(range(min = 1, max = 100))]
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,

    /// Initial retry delay in milliseconds
    #[validate(range(min = 1))]
    #[serde(default = "default_retry_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Maximum retry delay in milliseconds
    #[validate(range(min = 1))]
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_retry_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_initial_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_retry_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            initial_delay_ms: default_retry_initial_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            backoff_multiplier: default_retry_backoff_multiplier(),
        }
    }
}

/// Dead-letter queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DlqSettings {
    /// Location of the append-only JSON-lines file
    #[serde(default = "default_dlq_path")]
    pub path: PathBuf,
}

fn default_dlq_path() -> PathBuf {
    PathBuf::from("dead_letters.jsonl")
}

impl Default for DlqSettings {
    fn default() -> Self {
        Self {
            path: default_dlq_path(),
        }
    }
}
