//! Per-job-type limit maps with a `*` default.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Key used for the default entry of a limit map.
pub const DEFAULT_KEY: &str = "*";

/// A per-type limit with a fallback used for every unlisted type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeLimits<T> {
    default: T,
    overrides: HashMap<String, T>,
}

impl<T> TypeLimits<T> {
    /// Creates a limit map where every type gets `default`.
    pub fn new(default: T) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    /// Applies configured values on top of the built-in default.
    ///
    /// A `*` entry in `configured` replaces the default.
    pub fn with_overrides(mut self, configured: impl IntoIterator<Item = (String, T)>) -> Self {
        for (job_type, value) in configured {
            if job_type == DEFAULT_KEY {
                self.default = value;
            } else {
                self.overrides.insert(job_type, value);
            }
        }
        self
    }

    /// Returns the limit for `job_type`.
    pub fn for_type(&self, job_type: &str) -> &T {
        self.overrides.get(job_type).unwrap_or(&self.default)
    }

    /// Returns the default limit.
    pub fn default_value(&self) -> &T {
        &self.default
    }
}

/// Per-type limits that govern claims and dispatcher runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLimits {
    /// Seconds a claim may be held before it is reclaimable.
    pub claim_ttl: TypeLimits<u64>,
    /// Attempts before an expired claim is abandoned instead of released.
    pub attempts: TypeLimits<u64>,
    /// Seconds of real time a dispatcher may run before it is signaled.
    pub max_real: TypeLimits<u64>,
    /// Memory limit handed to the dispatcher (e.g. `300M`).
    pub max_memory: TypeLimits<String>,
}

impl Default for JobLimits {
    fn default() -> Self {
        Self {
            claim_ttl: TypeLimits::new(3600),
            attempts: TypeLimits::new(3),
            max_real: TypeLimits::new(3600),
            max_memory: TypeLimits::new("300M".to_string()),
        }
    }
}
