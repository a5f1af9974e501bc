//! Service configuration shared by the runner and chron daemons.
//!
//! The configuration is a JSON file that may carry `//` comments. It is
//! loaded once at startup and is read-only afterwards.
//!
//! ```text
//! {
//!     "groups": {
//!         "basic": { "runners": 20, "include": ["*"], "exclude": ["webVideoTranscode"],
//!                    "low-priority": ["cirrusSearchLinksUpdate"] }
//!     },
//!     "limits": { "attempts": { "*": 3 }, "claimTTL": { "*": 3600 },
//!                 "real": { "*": 300 }, "memory": { "*": "300M" } },
//!     "redis": { "aggregators": ["rdb1:6379"], "queues": ["rdb1:6379", "rdb2:6379"] },
//!     "dispatcher": "php RunJobs.php --wiki=%(domain)x --type=%(type)x --maxtime=%(maxtime)x",
//!     "statsd": "statsd.eqiad.wmnet:8125"
//! }
//! ```

pub mod limits;
pub mod server;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub use limits::{JobLimits, TypeLimits};
pub use server::ServerAddr;

/// Default statsd port when the endpoint has none.
pub const DEFAULT_STATSD_PORT: u16 = 8125;

/// Time-sharing windows for the runner loops, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PriorityWindows {
    /// How long a loop may stay in low priority before high priority
    /// queues are checked again.
    pub hp_max_delay: u64,
    /// Dispatcher time box while the loop is in low priority. Should be
    /// lower than `lp_max_delay`.
    pub hp_max_time: u64,
    /// How long a loop may stay in high priority before low priority
    /// queues get a turn.
    pub lp_max_delay: u64,
    /// Dispatcher time box while the loop is in high priority. Should be
    /// lower than `hp_max_delay`.
    pub lp_max_time: u64,
}

impl Default for PriorityWindows {
    fn default() -> Self {
        Self {
            hp_max_delay: 120,
            hp_max_time: 30,
            lp_max_delay: 600,
            lp_max_time: 60,
        }
    }
}

/// A named group of runner slots dedicated to a subset of job types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerGroup {
    /// Group name from the configuration.
    pub name: String,
    /// Number of concurrent dispatcher slots.
    pub runners: usize,
    /// Job types to run; `*` means every pending type.
    pub include: Vec<String>,
    /// Job types never run by this group.
    pub exclude: Vec<String>,
    /// Job types only run while the group is in low priority.
    pub low_priority: Vec<String>,
}

/// Where to send statsd counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsdEndpoint {
    pub host: String,
    pub port: u16,
}

impl StatsdEndpoint {
    /// Parses `host[:port]`, defaulting to port 8125.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let addr = ServerAddr::parse(s).ok_or_else(|| ConfigError::InvalidStatsd(s.to_string()))?;
        Ok(Self {
            host: addr.host,
            port: addr.port.unwrap_or(DEFAULT_STATSD_PORT),
        })
    }
}

/// Fully validated service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Job queue partition servers.
    pub queue_servers: Vec<String>,
    /// Aggregator servers holding the ready-queue map and pool locks.
    pub aggregator_servers: Vec<String>,
    /// Optional Redis password.
    pub password: Option<String>,
    /// Dispatcher command template.
    pub dispatcher: String,
    /// Enabled runner groups, in name order.
    pub groups: Vec<RunnerGroup>,
    /// Per-type limits.
    pub limits: JobLimits,
    /// Priority time-sharing windows.
    pub priority: PriorityWindows,
    /// Optional statsd endpoint.
    pub statsd: Option<StatsdEndpoint>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    redis: RawRedis,
    #[serde(default)]
    dispatcher: Option<String>,
    #[serde(default)]
    groups: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    limits: RawLimits,
    #[serde(default)]
    priority: PriorityWindows,
    #[serde(default)]
    statsd: Option<String>,
    /// Accepted for compatibility; not used.
    #[serde(default)]
    #[allow(dead_code)]
    wrapper: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawRedis {
    queues: Vec<String>,
    aggregators: Vec<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLimits {
    #[serde(default, rename = "claimTTL")]
    claim_ttl: HashMap<String, u64>,
    #[serde(default)]
    attempts: HashMap<String, u64>,
    #[serde(default)]
    real: HashMap<String, u64>,
    #[serde(default)]
    memory: HashMap<String, serde_json::Value>,
}

impl ServiceConfig {
    /// Loads and validates the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })
    }

    /// Parses and validates configuration text.
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let stripped = strip_comments(content);
        let raw: RawConfig =
            serde_json::from_str(stripped.trim()).map_err(|source| ConfigError::Parse {
                path: "<inline>".to_string(),
                source,
            })?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        if raw.redis.aggregators.is_empty() {
            return Err(ConfigError::EmptyServerList("redis.aggregators"));
        }
        if raw.redis.queues.is_empty() {
            return Err(ConfigError::EmptyServerList("redis.queues"));
        }
        for server in raw.redis.aggregators.iter().chain(&raw.redis.queues) {
            if ServerAddr::parse(server).is_none() {
                return Err(ConfigError::InvalidServer(server.clone()));
            }
        }

        let dispatcher = raw
            .dispatcher
            .filter(|d| !d.trim().is_empty())
            .ok_or(ConfigError::MissingDispatcher)?;

        let mut groups = Vec::new();
        for (name, value) in &raw.groups {
            if let Some(group) = parse_group(name, value)? {
                groups.push(group);
            }
        }

        let priority = raw.priority;
        let limits = build_limits(raw.limits, &priority)?;

        let statsd = raw
            .statsd
            .filter(|s| !s.is_empty())
            .map(|s| StatsdEndpoint::parse(&s))
            .transpose()?;

        Ok(Self {
            queue_servers: raw.redis.queues,
            aggregator_servers: raw.redis.aggregators,
            password: raw.redis.password,
            dispatcher,
            groups,
            limits,
            priority,
            statsd,
        })
    }
}

/// Removes `//` comments while leaving string literals (such as URLs in the
/// dispatcher command) untouched.
fn strip_comments(content: &str) -> String {
    static COMMENTS: OnceLock<Regex> = OnceLock::new();
    let re = COMMENTS.get_or_init(|| {
        Regex::new(r#""(?:\\.|[^"\\])*"|//[^\n]*"#).expect("comment pattern is a valid regex")
    });
    re.replace_all(content, |caps: &regex::Captures<'_>| {
        let m = &caps[0];
        if m.starts_with('"') {
            m.to_string()
        } else {
            String::new()
        }
    })
    .into_owned()
}

fn parse_group(name: &str, value: &serde_json::Value) -> Result<Option<RunnerGroup>, ConfigError> {
    let invalid = |field: &'static str| ConfigError::InvalidGroup {
        group: name.to_string(),
        field,
    };

    let runners = value
        .get("runners")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| invalid("runners"))?;
    if runners == 0 {
        // loop disabled
        return Ok(None);
    }

    let list = |field: &'static str| -> Result<Vec<String>, ConfigError> {
        match value.get(field) {
            None | Some(serde_json::Value::Null) => Ok(Vec::new()),
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string).ok_or_else(|| invalid(field)))
                .collect(),
            Some(_) => Err(invalid(field)),
        }
    };

    Ok(Some(RunnerGroup {
        name: name.to_string(),
        runners: runners as usize,
        include: list("include")?,
        exclude: list("exclude")?,
        low_priority: list("low-priority")?,
    }))
}

fn build_limits(raw: RawLimits, priority: &PriorityWindows) -> Result<JobLimits, ConfigError> {
    let defaults = JobLimits::default();

    // Avoid killing processes before they get a fair chance to exit
    let min_real = 2 * priority.lp_max_time.max(priority.hp_max_time);
    let real = raw
        .real
        .into_iter()
        .map(|(job_type, secs)| (job_type, secs.max(min_real)));

    let memory = raw
        .memory
        .into_iter()
        .map(|(job_type, value)| match value {
            serde_json::Value::String(s) => Ok((job_type, s)),
            serde_json::Value::Number(n) => Ok((job_type, n.to_string())),
            other => Err(ConfigError::InvalidLimit {
                kind: "memory",
                job_type,
                reason: format!("expected string or number, got {}", other),
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(JobLimits {
        claim_ttl: defaults.claim_ttl.with_overrides(raw.claim_ttl),
        attempts: defaults.attempts.with_overrides(raw.attempts),
        max_real: defaults.max_real.with_overrides(real),
        max_memory: defaults.max_memory.with_overrides(memory),
    })
}
