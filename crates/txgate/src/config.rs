//! Configuration surface.
//!
//! ```json
//! {
//!   "pointcut_rules": [
//!     { "kind": "name_pattern", "type_suffix": "Service",
//!       "method_prefixes": ["save", "update", "delete", "upgrade"] }
//!   ],
//!   "isolation_level": "read_committed",
//!   "worker_pool_size": 5,
//!   "event_queue_capacity": 256,
//!   "drain_timeout_ms": 5000
//! }
//! ```
//!
//! [`TxConfig::load`] reads an optional JSON file, then environment variables
//! prefixed with `TXGATE_` (`TXGATE_WORKER_POOL_SIZE=8`), later sources
//! overriding earlier ones.

use ::config::builder::DefaultState;
use ::config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::dispatch::DispatchSettings;
use crate::error::{TxError, TxResult};
use crate::pointcut::{Pointcut, PointcutRuleConfig};
use crate::transaction::IsolationLevel;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "TXGATE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxConfig {
    /// Active rule set. A call is transactional if any rule matches.
    pub pointcut_rules: Vec<PointcutRuleConfig>,
    pub isolation_level: IsolationLevel,
    /// Fixed number of dispatch workers. Must be at least 1.
    pub worker_pool_size: usize,
    /// Bounded queue between committing callers and workers. Must be at least 1.
    pub event_queue_capacity: usize,
    /// How long shutdown waits for queued events.
    pub drain_timeout_ms: u64,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            pointcut_rules: vec![PointcutRuleConfig::service_naming()],
            isolation_level: IsolationLevel::Default,
            worker_pool_size: 5,
            event_queue_capacity: 256,
            drain_timeout_ms: 5_000,
        }
    }
}

impl TxConfig {
    /// Load from an optional JSON file plus `TXGATE_*` environment
    /// variables, then validate.
    pub fn load(path: Option<&str>) -> TxResult<Self> {
        Self::load_with(path, Self::environment())
    }

    /// Parse and validate a JSON document, without environment overrides.
    pub fn from_json(json: &str) -> TxResult<Self> {
        Self::build_from(Config::builder().add_source(File::from_str(json, FileFormat::Json)))
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX).try_parsing(true)
    }

    fn load_with(path: Option<&str>, environment: Environment) -> TxResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::new(path, FileFormat::Json).required(true));
        }
        Self::build_from(builder.add_source(environment))
    }

    fn build_from(builder: ConfigBuilder<DefaultState>) -> TxResult<Self> {
        let config: Self = builder
            .build()
            .and_then(|raw| raw.try_deserialize())
            .map_err(|e| TxError::config(format!("malformed configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject anything that would only fail later, at call time.
    pub fn validate(&self) -> TxResult<()> {
        if self.worker_pool_size == 0 {
            return Err(TxError::config("worker_pool_size must be at least 1"));
        }
        if self.event_queue_capacity == 0 {
            return Err(TxError::config("event_queue_capacity must be at least 1"));
        }
        self.pointcut().map(|_| ())
    }

    /// Compile the configured rules.
    pub fn pointcut(&self) -> TxResult<Pointcut> {
        Pointcut::from_configs(&self.pointcut_rules)
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            worker_pool_size: self.worker_pool_size,
            queue_capacity: self.event_queue_capacity,
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
        }
    }
}
