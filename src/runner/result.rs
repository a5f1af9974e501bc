//! Dispatcher result parsing.

use serde::Deserialize;

/// What a dispatcher prints on success: `{"jobs":[{"status":"ok"}, ...]}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DispatcherResult {
    pub jobs: Vec<JobOutcome>,
}

/// One executed job.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobOutcome {
    #[serde(default)]
    pub status: serde_json::Value,
}

impl JobOutcome {
    pub fn is_ok(&self) -> bool {
        self.status.as_str() == Some("ok")
    }
}

impl DispatcherResult {
    /// Parses trimmed dispatcher output.
    pub fn parse(output: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(output.trim())
    }

    /// Returns `(ok, failed)` job counts.
    pub fn tally(&self) -> (u64, u64) {
        let ok = self.jobs.iter().filter(|j| j.is_ok()).count() as u64;
        (ok, self.jobs.len() as u64 - ok)
    }
}
