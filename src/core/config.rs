use crate::core::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Engine configuration with all tuning parameters.
///
/// Durations are (de)serialized as milliseconds under a `_ms` key so the YAML
/// form stays plain numbers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    // Identity
    /// Lock owner written on acquired jobs. Unique per engine node.
    pub node_id: String,

    // Job acquisition
    /// How long an acquired job stays locked to this node
    #[serde(rename = "lock_duration_ms", with = "duration_ms")]
    pub lock_duration: Duration,
    /// Maximum jobs locked per acquisition cycle
    pub acquisition_batch_size: usize,
    /// Idle wait between acquisition cycles when nothing was due
    #[serde(rename = "acquisition_wait_ms", with = "duration_ms")]
    pub acquisition_wait: Duration,
    /// Worker pool size
    pub max_workers: usize,

    // Retry configuration
    /// Retries given to newly created jobs
    pub default_job_retries: u32,
    /// Delay before the first retry
    #[serde(rename = "retry_delay_ms", with = "duration_ms")]
    pub retry_delay: Duration,
    /// Cap for the backoff delay
    #[serde(rename = "max_retry_delay_ms", with = "duration_ms")]
    pub max_retry_delay: Duration,
    /// Retry backoff multiplier
    pub retry_backoff_multiplier: f64,
    /// Longer exception messages are truncated before being stored on the job
    pub max_exception_message_length: usize,

    // Limits
    /// Guard against definitions that loop without a wait state
    pub max_operations_per_command: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);

        Self {
            node_id: format!("node-{}", Uuid::new_v4()),

            lock_duration: Duration::from_secs(300), // 5 minutes
            acquisition_batch_size: 10,
            acquisition_wait: Duration::from_secs(5),
            max_workers: cpu_count * 2,

            default_job_retries: 3,
            retry_delay: Duration::from_secs(10),
            max_retry_delay: Duration::from_secs(600),
            retry_backoff_multiplier: 2.0,
            max_exception_message_length: 4000,

            max_operations_per_command: 10_000,
        }
    }
}

impl EngineConfig {
    /// Create a new builder for EngineConfig
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            EngineError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(EngineError::configuration_field(
                "node_id must not be empty",
                "node_id",
            ));
        }

        // Acquisition validation
        if self.max_workers == 0 {
            return Err(EngineError::configuration_field(
                "max_workers must be greater than 0",
                "max_workers",
            ));
        }
        if self.acquisition_batch_size == 0 {
            return Err(EngineError::configuration_field(
                "acquisition_batch_size must be greater than 0",
                "acquisition_batch_size",
            ));
        }
        if self.lock_duration.is_zero() {
            return Err(EngineError::configuration_field(
                "lock_duration must be greater than 0",
                "lock_duration_ms",
            ));
        }

        // Retry validation
        if self.retry_backoff_multiplier < 1.0 {
            return Err(EngineError::configuration_field(
                "retry_backoff_multiplier must be >= 1.0",
                "retry_backoff_multiplier",
            ));
        }
        if self.retry_delay > self.max_retry_delay {
            return Err(EngineError::configuration_field(
                "retry_delay cannot exceed max_retry_delay",
                "retry_delay_ms",
            ));
        }
        if self.max_exception_message_length == 0 {
            return Err(EngineError::configuration_field(
                "max_exception_message_length must be greater than 0",
                "max_exception_message_length",
            ));
        }

        if self.max_operations_per_command == 0 {
            return Err(EngineError::configuration_field(
                "max_operations_per_command must be greater than 0",
                "max_operations_per_command",
            ));
        }

        Ok(())
    }

    /// Delay before retry number `attempt` (1-based): exponential backoff capped
    /// at `max_retry_delay`.
    pub fn retry_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let factor = self.retry_backoff_multiplier.powi(exponent);
        let delay = self.retry_delay.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_retry_delay.as_secs_f64() {
            self.max_retry_delay
        } else {
            Duration::from_secs_f64(delay)
        }
    }

    /// Create a configuration suited to tests: short waits and immediate retries
    pub fn development() -> Self {
        Self {
            max_workers: 4,
            acquisition_wait: Duration::from_millis(50),
            retry_delay: Duration::ZERO,
            max_retry_delay: Duration::from_secs(1),
            ..Default::default()
        }
    }
}

/// Builder for EngineConfig
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.config.node_id = node_id.into();
        self
    }

    pub fn lock_duration(mut self, duration: Duration) -> Self {
        self.config.lock_duration = duration;
        self
    }

    pub fn acquisition_batch_size(mut self, size: usize) -> Self {
        self.config.acquisition_batch_size = size;
        self
    }

    pub fn acquisition_wait(mut self, wait: Duration) -> Self {
        self.config.acquisition_wait = wait;
        self
    }

    /// Set maximum workers
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.config.max_workers = max_workers;
        self
    }

    pub fn default_job_retries(mut self, retries: u32) -> Self {
        self.config.default_job_retries = retries;
        self
    }

    /// Set retry delays
    pub fn retry_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.config.retry_delay = initial;
        self.config.max_retry_delay = max;
        self
    }

    pub fn retry_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.retry_backoff_multiplier = multiplier;
        self
    }

    pub fn max_exception_message_length(mut self, length: usize) -> Self {
        self.config.max_exception_message_length = length;
        self
    }

    pub fn max_operations_per_command(mut self, limit: usize) -> Self {
        self.config.max_operations_per_command = limit;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
