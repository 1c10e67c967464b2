use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::CallState;

/// Which outbound leg of a conference a call is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ordinal {
    First,
    Second,
}

impl fmt::Display for Ordinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ordinal::First => write!(f, "first"),
            Ordinal::Second => write!(f, "second"),
        }
    }
}

/// The risky step a confirmation request guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmStep {
    FirstCall,
    SecondCall,
    Merge,
}

impl fmt::Display for ConfirmStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfirmStep::FirstCall => write!(f, "first call"),
            ConfirmStep::SecondCall => write!(f, "second call"),
            ConfirmStep::Merge => write!(f, "merge"),
        }
    }
}

/// Why a conference flow ended in `Failed`.
///
/// Merge failures and report-delivery failures are deliberately absent:
/// both are soft errors that never fail the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// A leg's connect timer elapsed before the call went active.
    NoAnswer(Ordinal),
    /// The job-wide dead-man timer elapsed.
    OverallTimeout,
    /// A call dropped before the flow reached a state where that was expected.
    EarlyDisconnect(Ordinal),
    /// A confirmation step was declined, explicitly or by timeout.
    Declined(ConfirmStep),
    /// The provider refused to place a call.
    PlacementFailed(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NoAnswer(ordinal) => {
                write!(f, "{ordinal} call was not answered in time")
            }
            FailureReason::OverallTimeout => write!(f, "overall timeout reached"),
            FailureReason::EarlyDisconnect(ordinal) => {
                write!(f, "{ordinal} call ended before the flow completed")
            }
            FailureReason::Declined(step) => write!(f, "confirmation declined at {step}"),
            FailureReason::PlacementFailed(msg) => write!(f, "call placement failed: {msg}"),
        }
    }
}

/// Terminal result of one conference job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConferenceOutcome {
    /// Both parties were reachable; the merge itself may or may not have
    /// succeeded (merge failure is soft).
    Completed,
    Failed(FailureReason),
}

impl fmt::Display for ConferenceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConferenceOutcome::Completed => write!(f, "completed"),
            ConferenceOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Tracks the lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Every timer and retry budget in the conference flow, in one place.
#[derive(Debug, Clone)]
pub struct FlowTiming {
    /// Max wait for the first call to go active.
    pub first_connect_timeout: Duration,
    /// Dead-man timer bounding the entire job regardless of state.
    pub overall_timeout: Duration,
    /// Pause between the first connect and the second dial, so the
    /// telephony stack settles before taking another call.
    pub settle_delay: Duration,
    /// Auto-decline window for an unanswered confirmation prompt.
    pub confirm_timeout: Duration,
    /// Pause before the merge attempt once both legs are up.
    pub merge_delay: Duration,
    /// Wait before checking whether the provider reports a conference.
    pub merge_verify_delay: Duration,
    /// Interval between samples of the second leg's provider state.
    pub second_poll_interval: Duration,
    /// Samples of the second leg before giving up and proceeding anyway.
    pub second_poll_attempts: u32,
}

impl Default for FlowTiming {
    fn default() -> Self {
        Self {
            first_connect_timeout: Duration::from_secs(60),
            overall_timeout: Duration::from_secs(180),
            settle_delay: Duration::from_secs(1),
            confirm_timeout: Duration::from_secs(30),
            merge_delay: Duration::from_secs(3),
            merge_verify_delay: Duration::from_secs(2),
            second_poll_interval: Duration::from_secs(2),
            second_poll_attempts: 30,
        }
    }
}

/// One warm-transfer request: dial the first party, dial the second,
/// merge both into a conference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallJob {
    pub id: i64,
    pub first_party: String,
    pub second_party: String,
    /// When true, every confirmation gate is bypassed.
    pub auto_accept: bool,
    pub status: JobStatus,
    pub state: CallState,
    pub state_history: Vec<CallState>,
    pub created_at: DateTime<Utc>,
}

impl CallJob {
    pub fn new(id: i64, first_party: String, second_party: String, auto_accept: bool) -> Self {
        Self {
            id,
            first_party,
            second_party,
            auto_accept,
            status: JobStatus::Pending,
            state: CallState::Idle,
            state_history: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// The number a given leg dials.
    pub fn number_for(&self, ordinal: Ordinal) -> &str {
        match ordinal {
            Ordinal::First => &self.first_party,
            Ordinal::Second => &self.second_party,
        }
    }
}

/// Structured summary produced once a job reaches a terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct FlowReport {
    pub job_id: i64,
    pub first_party: String,
    pub second_party: String,
    pub status: JobStatus,
    pub outcome: ConferenceOutcome,
    pub state_transitions: Vec<CallState>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl FlowReport {
    /// Generate a report from a job that has reached a terminal state.
    pub fn from_job(job: &CallJob, outcome: ConferenceOutcome) -> Self {
        let now = Utc::now();
        let duration = now - job.created_at;
        let mut transitions = job.state_history.clone();
        transitions.push(job.state);

        Self {
            job_id: job.id,
            first_party: job.first_party.clone(),
            second_party: job.second_party.clone(),
            status: job.status,
            outcome,
            state_transitions: transitions,
            started_at: job.created_at,
            completed_at: now,
            duration_ms: duration.num_milliseconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_creation_defaults() {
        let job = CallJob::new(7, "+15550100".into(), "+15550199".into(), true);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.state, CallState::Idle);
        assert!(job.state_history.is_empty());
        assert!(job.auto_accept);
        assert_eq!(job.number_for(Ordinal::First), "+15550100");
        assert_eq!(job.number_for(Ordinal::Second), "+15550199");
    }

    #[test]
    fn timing_defaults_match_the_flow_budget() {
        let timing = FlowTiming::default();
        assert_eq!(timing.first_connect_timeout, Duration::from_secs(60));
        assert_eq!(timing.overall_timeout, Duration::from_secs(180));
        assert_eq!(timing.confirm_timeout, Duration::from_secs(30));
        // 30 attempts * 2s = 60s budget for the second leg.
        assert_eq!(timing.second_poll_attempts, 30);
        assert_eq!(timing.second_poll_interval, Duration::from_secs(2));
    }

    #[test]
    fn failure_reason_display() {
        assert_eq!(
            FailureReason::NoAnswer(Ordinal::First).to_string(),
            "first call was not answered in time"
        );
        assert_eq!(
            FailureReason::Declined(ConfirmStep::Merge).to_string(),
            "confirmation declined at merge"
        );
        assert_eq!(
            FailureReason::OverallTimeout.to_string(),
            "overall timeout reached"
        );
    }

    #[test]
    fn outcome_display() {
        assert_eq!(ConferenceOutcome::Completed.to_string(), "completed");
        assert_eq!(
            ConferenceOutcome::Failed(FailureReason::OverallTimeout).to_string(),
            "failed: overall timeout reached"
        );
    }

    #[test]
    fn report_from_job() {
        let job = CallJob::new(3, "+15550100".into(), "+15550199".into(), false);
        let report = FlowReport::from_job(&job, ConferenceOutcome::Completed);

        assert_eq!(report.job_id, 3);
        assert_eq!(report.state_transitions, vec![CallState::Idle]);
        assert_eq!(report.outcome, ConferenceOutcome::Completed);
    }

    #[test]
    fn job_serialization_roundtrip() {
        let job = CallJob::new(9, "+15550100".into(), "+15550199".into(), false);
        let json = serde_json::to_string(&job).unwrap();
        let deserialized: CallJob = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.id, 9);
        assert_eq!(deserialized.state, CallState::Idle);
    }
}
