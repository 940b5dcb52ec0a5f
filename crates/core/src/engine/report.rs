use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Terminal state of one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum StepStatus {
    /// `run` returned `Ok`
    Succeeded,

    /// `run` returned an error or the task panicked
    Failed(String),

    /// Force-terminated by the workflow timeout
    TimedOut,
}

impl StepStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, StepStatus::Succeeded)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Succeeded => f.write_str("succeeded"),
            StepStatus::Failed(reason) => write!(f, "failed: {reason}"),
            StepStatus::TimedOut => f.write_str("timed out"),
        }
    }
}

/// Outcome of one step instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub id: String,
    pub step_type: String,
    pub status: StepStatus,
}

/// Aggregate result of a workflow run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Workflow name
    pub workflow: String,

    /// One outcome per step, in workflow order
    pub outcomes: Vec<StepOutcome>,

    /// Whether the workflow timeout fired
    pub timed_out: bool,

    /// Wall time of the run
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

impl RunReport {
    /// True iff every step succeeded
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.outcomes.iter().all(|o| o.status.is_success())
    }

    /// Steps that did not succeed
    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.outcomes.iter().filter(|o| !o.status.is_success())
    }

    /// Look up the outcome of a step
    pub fn outcome(&self, id: &str) -> Option<&StepOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(id: &str, status: StepStatus) -> StepOutcome {
        StepOutcome {
            id: id.to_string(),
            step_type: "t".to_string(),
            status,
        }
    }

    #[test]
    fn test_report_success_is_and_of_steps() {
        let mut report = RunReport {
            workflow: "w".to_string(),
            outcomes: vec![outcome("a", StepStatus::Succeeded), outcome("b", StepStatus::Succeeded)],
            timed_out: false,
            elapsed: Duration::from_millis(5),
        };
        assert!(report.succeeded());
        assert_eq!(report.failures().count(), 0);

        report.outcomes[1].status = StepStatus::Failed("boom".to_string());
        assert!(!report.succeeded());
        let failed: Vec<_> = report.failures().map(|o| o.id.as_str()).collect();
        assert_eq!(failed, vec!["b"]);
        assert_eq!(report.outcome("b").unwrap().status.to_string(), "failed: boom");
    }

    #[test]
    fn test_report_serializes() {
        let report = RunReport {
            workflow: "w".to_string(),
            outcomes: vec![outcome("a", StepStatus::TimedOut)],
            timed_out: true,
            elapsed: Duration::from_millis(1500),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcomes"][0]["status"]["status"], "timed_out");
        assert_eq!(json["elapsed"], 1.5);
    }
}
