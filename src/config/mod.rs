// src/config/mod.rs
//! Conversion policies and heap limits
//!
//! Both structs deserialize from JSON with every field optional, so an
//! embedding can ship a partial config and fall back to the defaults:
//!
//! ```rust
//! use js_value_bridge::config::{BridgeConfig, CyclePolicy};
//!
//! let config = BridgeConfig::from_json(r#"{ "cycle_policy": "reject" }"#).unwrap();
//! assert_eq!(config.cycle_policy, CyclePolicy::Reject);
//! assert_eq!(config.max_depth, 512);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default nesting limit for one conversion call
pub const DEFAULT_MAX_DEPTH: usize = 512;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("max_depth must be at least 1")]
    ZeroDepth,
}

/// What to do when an object is reached again while it is still being converted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePolicy {
    /// Reproduce the cycle in the destination heap
    #[default]
    Memoize,
    /// Fail with `BridgeError::CyclicValue`
    Reject,
}

/// Treatment of symbols, externals and bigints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsupportedPolicy {
    /// Fail with `BridgeError::UnsupportedValue`
    #[default]
    Reject,
    /// Substitute `undefined`
    Undefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub cycle_policy: CyclePolicy,
    pub unsupported_policy: UnsupportedPolicy,
    pub max_depth: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            cycle_policy: CyclePolicy::default(),
            unsupported_policy: UnsupportedPolicy::default(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl BridgeConfig {
    pub fn from_json(source: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = serde_json::from_str(source)?;
        config.validate()
    }

    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_depth == 0 {
            return Err(ConfigError::ZeroDepth);
        }
        Ok(self)
    }

    pub fn with_cycle_policy(mut self, policy: CyclePolicy) -> Self {
        self.cycle_policy = policy;
        self
    }

    pub fn with_unsupported_policy(mut self, policy: UnsupportedPolicy) -> Self {
        self.unsupported_policy = policy;
        self
    }

    /// Nesting limit per call; zero is raised to 1, the smallest valid depth.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }
}

/// Size limits for one heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapLimits {
    /// Maximum number of live cells; `None` means unbounded
    pub max_live_cells: Option<usize>,
}

impl HeapLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_max_live_cells(max_live_cells: usize) -> Self {
        Self {
            max_live_cells: Some(max_live_cells),
        }
    }

    pub fn from_json(source: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(source)?)
    }
}
