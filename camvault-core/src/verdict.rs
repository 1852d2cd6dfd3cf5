use serde::{Deserialize, Serialize};

/// Terminal value of one unit of work. Aggregate tallies count only
/// `Failed` as a failure; a `Skipped` no-op is success-adjacent and never
/// inflates failure counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobVerdict {
    /// The work produced a clean result.
    Success,
    /// The engine gave up after exhausting its retry or policy budget.
    Failed,
    /// Nothing to do: the artifact already existed or policy skipped it.
    Skipped,
}

impl JobVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobVerdict::Success => "success",
            JobVerdict::Failed => "failed",
            JobVerdict::Skipped => "skipped",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobVerdict::Failed)
    }
}

impl std::fmt::Display for JobVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
