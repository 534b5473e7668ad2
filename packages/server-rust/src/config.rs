//! Configuration types for the `datahive` server components.

use std::time::Duration;

use datahive_core::codes;
use serde::Deserialize;

/// Top-level configuration bundle.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HiveConfig {
    /// Settings for in-memory channel connections.
    pub connection: ConnectionConfig,
    /// Long-running operation controller settings.
    pub long_running: LongRunningConfig,
    /// Log output settings.
    pub logging: LoggingConfig,
}

impl HiveConfig {
    /// Parses a configuration from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid JSON for this shape.
    pub fn from_json(input: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(input)?)
    }
}

/// Per-connection configuration controlling backpressure and reply timeouts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bounded mpsc channel capacity for outbound messages.
    pub outbound_channel_capacity: usize,
    /// How long a request waits for its reply before timing out.
    #[serde(with = "millis")]
    pub reply_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
            reply_timeout: Duration::from_secs(10),
        }
    }
}

/// Command codes used by a long-running operation controller.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LongRunningConfig {
    /// Code sent to cancel a running operation.
    pub stop_command_code: u32,
    /// Inbound codes carrying final results of running operations.
    pub reply_command_codes: Vec<u32>,
}

impl Default for LongRunningConfig {
    fn default() -> Self {
        Self {
            stop_command_code: codes::CC_CANCEL_OPERATION,
            reply_command_codes: vec![
                codes::CC_WRITE_OPERATION_RESULT,
                codes::CC_WRITE_ATTRIBUTES_OPERATION_RESULT,
            ],
        }
    }
}

/// Log output configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
