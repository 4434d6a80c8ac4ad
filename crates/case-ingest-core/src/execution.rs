//! Job parameters and immutable execution records.
//!
//! A job run is identified by its name plus the *identifying* subset of its
//! parameters. Launchers use [`JobParameters::identity_key`] to decide
//! whether a run has already been started. Non-identifying parameters travel
//! with the run but never make two runs distinct.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Parameter name carrying a comma-separated list of case ids.
pub const PARAM_CASE_IDS: &str = "caseIds";
/// Parameter name carrying a per-invocation trigger id.
pub const PARAM_TRIGGER_ID: &str = "triggerId";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParameter {
    pub value: String,
    pub identifying: bool,
}

/// Ordered parameter set for a job run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParameters {
    params: BTreeMap<String, JobParameter>,
}

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an identifying parameter.
    pub fn identifying(mut self, name: &str, value: impl Into<String>) -> Self {
        self.params.insert(
            name.to_string(),
            JobParameter {
                value: value.into(),
                identifying: true,
            },
        );
        self
    }

    /// Adds a parameter that does not participate in run identity.
    pub fn non_identifying(mut self, name: &str, value: impl Into<String>) -> Self {
        self.params.insert(
            name.to_string(),
            JobParameter {
                value: value.into(),
                identifying: false,
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|p| p.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JobParameter)> {
        self.params.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Splits a comma-separated list parameter, dropping blanks.
    pub fn list(&self, name: &str) -> Vec<String> {
        self.get(name)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stable hash over the identifying parameters only.
    pub fn identity_key(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, param) in self.params.iter().filter(|(_, p)| p.identifying) {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(param.value.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

/// Lifecycle of a single job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Starting,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Starting => "STARTING",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "STARTING" => Ok(RunStatus::Starting),
            "RUNNING" => Ok(RunStatus::Running),
            "COMPLETED" => Ok(RunStatus::Completed),
            "FAILED" => Ok(RunStatus::Failed),
            other => anyhow::bail!("unknown run status: '{}'", other),
        }
    }
}

/// Immutable context handed to a task for one run.
///
/// Never mutated in place: the `with_*` methods copy every field and
/// override only the named one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub job_name: String,
    pub run_id: String,
    pub parameters: JobParameters,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
}

impl ExecutionRecord {
    pub fn new(job_name: &str, run_id: &str, parameters: JobParameters) -> Self {
        Self {
            job_name: job_name.to_string(),
            run_id: run_id.to_string(),
            parameters,
            started_at: Utc::now(),
            status: RunStatus::Starting,
        }
    }

    pub fn with_status(&self, status: RunStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    pub fn with_parameters(&self, parameters: JobParameters) -> Self {
        Self {
            parameters,
            ..self.clone()
        }
    }

    pub fn with_parameter(&self, name: &str, value: &str, identifying: bool) -> Self {
        let params = if identifying {
            self.parameters.clone().identifying(name, value)
        } else {
            self.parameters.clone().non_identifying(name, value)
        };
        self.with_parameters(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_ignores_non_identifying_params() {
        let a = JobParameters::new()
            .identifying(PARAM_CASE_IDS, "a,b")
            .non_identifying("requestedBy", "alice");
        let b = JobParameters::new()
            .identifying(PARAM_CASE_IDS, "a,b")
            .non_identifying("requestedBy", "bob");
        assert_eq!(a.identity_key(), b.identity_key());

        let c = JobParameters::new().identifying(PARAM_CASE_IDS, "a,c");
        assert_ne!(a.identity_key(), c.identity_key());
    }

    #[test]
    fn list_splits_and_trims() {
        let p = JobParameters::new().identifying(PARAM_CASE_IDS, " a, ,b ,c");
        assert_eq!(p.list(PARAM_CASE_IDS), vec!["a", "b", "c"]);
        assert!(p.list("missing").is_empty());
    }

    #[test]
    fn derive_overrides_only_named_field() {
        let rec = ExecutionRecord::new("job", "run-1", JobParameters::new());
        let running = rec.with_status(RunStatus::Running);
        assert_eq!(rec.status, RunStatus::Starting);
        assert_eq!(running.status, RunStatus::Running);
        assert_eq!(running.run_id, rec.run_id);
        assert_eq!(running.started_at, rec.started_at);

        let with_param = running.with_parameter(PARAM_TRIGGER_ID, "t1", true);
        assert_eq!(with_param.parameters.get(PARAM_TRIGGER_ID), Some("t1"));
        assert_eq!(with_param.status, RunStatus::Running);
        assert!(running.parameters.is_empty());
    }
}
