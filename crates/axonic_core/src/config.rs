#[cfg(feature = "serde")]
use crate::error::{Error, Result};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How reference-count protocol violations are surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RefcountPolicy {
    /// Violations are returned as `UseAfterFree` / `DoubleFree`.
    Strict,
    /// Violations are logged at error level and the call becomes a no-op.
    Lenient,
}

impl Default for RefcountPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Strict
        } else {
            Self::Lenient
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ExecutionMode {
    #[default]
    Serial,
    Parallel,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Serial => "serial",
            Self::Parallel => "parallel",
        }
    }
}

pub const DEFAULT_MAX_ALLOCATION_BYTES: usize = 1 << 30;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    pub refcount: RefcountPolicy,
    pub max_allocation_bytes: usize,
    pub serialize_transfers: bool,
    pub execution: ExecutionMode,
    pub conservative: bool,
    pub throughput_smoothing: f64,
    pub timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refcount: RefcountPolicy::default(),
            max_allocation_bytes: DEFAULT_MAX_ALLOCATION_BYTES,
            serialize_transfers: false,
            execution: ExecutionMode::default(),
            conservative: false,
            throughput_smoothing: 0.5,
            timeout: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_refcount(mut self, policy: RefcountPolicy) -> Self {
        self.refcount = policy;
        self
    }

    pub fn with_max_allocation_bytes(mut self, bytes: usize) -> Self {
        self.max_allocation_bytes = bytes;
        self
    }

    pub fn with_serialized_transfers(mut self, serialize: bool) -> Self {
        self.serialize_transfers = serialize;
        self
    }

    pub fn with_execution(mut self, mode: ExecutionMode) -> Self {
        self.execution = mode;
        self
    }

    pub fn with_conservative(mut self, conservative: bool) -> Self {
        self.conservative = conservative;
        self
    }

    pub fn with_throughput_smoothing(mut self, alpha: f64) -> Self {
        self.throughput_smoothing = alpha.clamp(f64::MIN_POSITIVE, 1.0);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Conservative mode forces serial execution everywhere.
    pub fn effective_execution(&self) -> ExecutionMode {
        if self.conservative {
            ExecutionMode::Serial
        } else {
            self.execution
        }
    }

    #[cfg(feature = "serde")]
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::DeserializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conservative_forces_serial() {
        let config = Config::new().with_execution(ExecutionMode::Parallel);
        assert_eq!(config.effective_execution(), ExecutionMode::Parallel);

        let config = config.with_conservative(true);
        assert_eq!(config.effective_execution(), ExecutionMode::Serial);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn partial_json_keeps_defaults() -> Result<()> {
        let config = Config::from_json(r#"{ "max_allocation_bytes": 4096, "execution": "Parallel" }"#)?;
        assert_eq!(config.max_allocation_bytes, 4096);
        assert_eq!(config.execution, ExecutionMode::Parallel);
        assert!(!config.serialize_transfers);
        Ok(())
    }
}
