//! Transport configuration.
//!
//! All tunables are plain data with serde defaults so a partial TOML document
//! only overrides what it names. Sizes that depend on the fabric (eager limit,
//! RDMA write size) are inputs, never constants baked into the engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::free_list::FreeListConfig;
use crate::header::MAX_HEADER_LEN;

/// Errors found while loading or validating a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The TOML document could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// A field holds a value outside its allowed range.
    #[error("{field}: {reason}")]
    OutOfRange {
        /// Field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Configuration for the RDMA transport component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PtlConfig {
    /// Initial number of descriptors in each free list (default 8).
    pub free_list_num: usize,
    /// Maximum number of descriptors in each free list (default 1024).
    pub free_list_max: usize,
    /// Descriptors added each time a free list grows (default 32).
    pub free_list_inc: usize,
    /// Largest payload sent eagerly, in bytes (default 64 KiB).
    pub eager_limit: usize,
    /// Largest single RDMA write issued for rendezvous data (default 128 KiB).
    pub max_put_size: usize,
    /// log2 of the registry hints table size (default 8, i.e. 256 slots).
    pub mem_registry_hints_log_size: u32,
    /// Receive descriptors preposted on each queue pair (default 16).
    pub recv_prepost: usize,
    /// Selection priority reported at initialization (default 50).
    pub priority: i32,
    /// Maximum completions drained per module in one progress call (default 64).
    pub cq_poll_batch: usize,
}

impl Default for PtlConfig {
    fn default() -> Self {
        Self {
            free_list_num: 8,
            free_list_max: 1024,
            free_list_inc: 32,
            eager_limit: 64 * 1024,
            max_put_size: 128 * 1024,
            mem_registry_hints_log_size: 8,
            recv_prepost: 16,
            priority: 50,
            cq_poll_batch: 64,
        }
    }
}

impl PtlConfig {
    /// Parses a TOML document; fields not present keep their defaults.
    pub fn from_toml_str(doc: &str) -> Result<Self, ConfigError> {
        let config: PtlConfig =
            toml::from_str(doc).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the relations between fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.free_list_max == 0 {
            return Err(out_of_range("free_list_max", "must be non-zero"));
        }
        if self.free_list_num > self.free_list_max {
            return Err(out_of_range(
                "free_list_num",
                format!("{} exceeds free_list_max {}", self.free_list_num, self.free_list_max),
            ));
        }
        if self.free_list_inc == 0 && self.free_list_num < self.free_list_max {
            return Err(out_of_range("free_list_inc", "must be non-zero when the list can grow"));
        }
        if self.eager_limit < MAX_HEADER_LEN {
            return Err(out_of_range(
                "eager_limit",
                format!("must be at least {} bytes", MAX_HEADER_LEN),
            ));
        }
        if self.max_put_size == 0 {
            return Err(out_of_range("max_put_size", "must be non-zero"));
        }
        if self.mem_registry_hints_log_size > 24 {
            return Err(out_of_range("mem_registry_hints_log_size", "must be at most 24"));
        }
        if self.recv_prepost == 0 {
            return Err(out_of_range("recv_prepost", "must be non-zero"));
        }
        if self.cq_poll_batch == 0 {
            return Err(out_of_range("cq_poll_batch", "must be non-zero"));
        }
        Ok(())
    }

    /// Sizing shared by the component-wide descriptor lists.
    pub fn free_list(&self) -> FreeListConfig {
        FreeListConfig {
            initial: self.free_list_num,
            increment: self.free_list_inc,
            max: self.free_list_max,
        }
    }

    /// Number of slots in the registry hints table.
    pub fn hints_table_size(&self) -> usize {
        1usize << self.mem_registry_hints_log_size
    }
}

fn out_of_range(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        reason: reason.into(),
    }
}

/// Runtime tuning requests accepted by `PtlComponent::control`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlParam {
    /// Enable or disable the transport. A disabled transport rejects new
    /// sends and its progress call does nothing.
    Enable(bool),
    /// Change the eager limit for subsequent sends.
    EagerLimit(usize),
    /// Change the RDMA write size for subsequent puts.
    MaxPutSize(usize),
}
