//! Configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default pause of an idle worker.
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(50);

/// Shortest idle pause. Smaller values, zero included, are raised to this so an
/// idle worker never spins.
pub const MIN_IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Default broadcast channel capacity for executor events.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

const ENV_NAME: &str = "SERIAL_EXECUTOR_NAME";
const ENV_IDLE_SLEEP_MS: &str = "SERIAL_EXECUTOR_IDLE_SLEEP_MS";
const ENV_EVENT_CAPACITY: &str = "SERIAL_EXECUTOR_EVENT_CAPACITY";

/// Executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Worker thread name.
    pub name: String,
    /// How long the worker waits when both queues are empty. At least [`MIN_IDLE_SLEEP`].
    #[serde(rename = "idle_sleep_ms", with = "duration_ms")]
    pub idle_sleep: Duration,
    /// Capacity of the event broadcast channel (lagging receivers lose old events).
    pub event_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: "serial-executor".to_string(),
            idle_sleep: DEFAULT_IDLE_SLEEP,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_idle_sleep(mut self, idle_sleep: Duration) -> Self {
        self.idle_sleep = idle_sleep.max(MIN_IDLE_SLEEP);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Defaults overridden by `SERIAL_EXECUTOR_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable name.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(name) = lookup(ENV_NAME).filter(|n| !n.trim().is_empty()) {
            config.name = name;
        }
        if let Some(ms) = lookup(ENV_IDLE_SLEEP_MS) {
            let ms = parse_number(ENV_IDLE_SLEEP_MS, &ms)?;
            config.idle_sleep = Duration::from_millis(ms).max(MIN_IDLE_SLEEP);
        }
        if let Some(capacity) = lookup(ENV_EVENT_CAPACITY) {
            let capacity = parse_number(ENV_EVENT_CAPACITY, &capacity)?;
            if capacity == 0 {
                return Err(ConfigError::InvalidValue {
                    key: ENV_EVENT_CAPACITY.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
            config.event_capacity = capacity as usize;
        }

        Ok(config)
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{value:?}: {e}"),
        })
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::MIN_IDLE_SLEEP;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(|ms| Duration::from_millis(ms).max(MIN_IDLE_SLEEP))
    }
}
