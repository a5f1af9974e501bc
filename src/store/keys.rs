//! Storage key layout and queue name encoding.
//!
//! The key names match what the job queue producers and consumers use, so
//! the runner and chron daemons can share partitions with them.

/// Hash of (encoded queue name => UNIX timestamp) on the aggregators.
pub const READY_QUEUE_KEY: &str = "jobqueue:aggregator:h-ready-queues:v2";

/// Set of JSON-encoded `[type, domain]` pairs on each partition.
pub const QUEUES_WITH_JOBS_KEY: &str = "global:jobqueue:s-queuesWithJobs";

/// Synthetic ready-map field marking the sweep generation.
pub const EPOCH_FIELD: &str = "_epoch";

/// Staging key the ready map is written to before being renamed live.
pub fn ready_queue_temp_key() -> String {
    format!("{}:temp", READY_QUEUE_KEY)
}

/// Encodes a queue identity as `urlencode(type)/urlencode(domain)`.
pub fn encode_queue_name(job_type: &str, domain: &str) -> String {
    format!(
        "{}/{}",
        urlencoding::encode(job_type),
        urlencoding::encode(domain)
    )
}

/// Decodes a queue name produced by [`encode_queue_name`].
///
/// Splits on the first `/`; returns `None` if there is no separator or a
/// part does not decode to UTF-8.
pub fn decode_queue_name(name: &str) -> Option<(String, String)> {
    let (job_type, domain) = name.split_once('/')?;
    let job_type = urlencoding::decode(job_type).ok()?;
    let domain = urlencoding::decode(domain).ok()?;
    Some((job_type.into_owned(), domain.into_owned()))
}

/// Encodes a queue identity the way members of the queues-with-jobs set are
/// stored: a JSON array `["type","domain"]`.
pub fn queue_set_member(job_type: &str, domain: &str) -> String {
    serde_json::Value::from(vec![job_type, domain]).to_string()
}

/// Parses a member of the queues-with-jobs set.
pub fn parse_queue_set_member(member: &str) -> Result<(String, String), serde_json::Error> {
    serde_json::from_str(member)
}

/// The per-queue structures held on a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    /// Sorted set of job id => claim timestamp.
    pub claimed: String,
    /// Hash of job id => attempts so far.
    pub attempts: String,
    /// FIFO list of job ids.
    pub unclaimed: String,
    /// Hash of job id => opaque payload.
    pub data: String,
    /// Sorted set of job id => abandon timestamp.
    pub abandoned: String,
    /// Sorted set of job id => ready-at timestamp.
    pub delayed: String,
}

impl QueueKeys {
    pub fn new(job_type: &str, domain: &str) -> Self {
        let key = |suffix: &str| -> String {
            format!("{}:jobqueue:{}:{}", domain, job_type, suffix)
        };
        Self {
            claimed: key("z-claimed"),
            attempts: key("h-attempts"),
            unclaimed: key("l-unclaimed"),
            data: key("h-data"),
            abandoned: key("z-abandoned"),
            delayed: key("z-delayed"),
        }
    }

    /// Keys in the order the reclamation script expects them.
    pub fn script_keys(&self) -> [&str; 7] {
        [
            &self.claimed,
            &self.attempts,
            &self.unclaimed,
            &self.data,
            &self.abandoned,
            &self.delayed,
            QUEUES_WITH_JOBS_KEY,
        ]
    }
}

/// Name of pool lock slot `slot` for the critical section `name`.
pub fn pool_lock_key(name: &str, slot: usize) -> String {
    format!("{}:lock:{}", name, slot)
}
