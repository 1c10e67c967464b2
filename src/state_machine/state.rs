use std::fmt;

use serde::{Deserialize, Serialize};

use super::job::{CallJob, ConferenceOutcome, ConfirmStep, FailureReason, JobStatus, Ordinal};

/// The states of the warm-transfer flow.
///
/// A job flows through:
/// IDLE → DIALING_FIRST → AWAIT_FIRST_CONNECT → DIALING_SECOND →
/// AWAIT_SECOND_CONNECT → MERGING → COMPLETED/FAILED, with the
/// AWAIT_*_CONFIRM states inserted before each risky step unless the job
/// runs in auto-accept mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    Idle,
    AwaitFirstConfirm,
    DialingFirst,
    AwaitFirstConnect,
    AwaitSecondConfirm,
    DialingSecond,
    AwaitSecondConnect,
    AwaitMergeConfirm,
    Merging,
    Completed,
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Completed | CallState::Failed)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "IDLE",
            CallState::AwaitFirstConfirm => "AWAIT_FIRST_CONFIRM",
            CallState::DialingFirst => "DIALING_FIRST",
            CallState::AwaitFirstConnect => "AWAIT_FIRST_CONNECT",
            CallState::AwaitSecondConfirm => "AWAIT_SECOND_CONFIRM",
            CallState::DialingSecond => "DIALING_SECOND",
            CallState::AwaitSecondConnect => "AWAIT_SECOND_CONNECT",
            CallState::AwaitMergeConfirm => "AWAIT_MERGE_CONFIRM",
            CallState::Merging => "MERGING",
            CallState::Completed => "COMPLETED",
            CallState::Failed => "FAILED",
        };
        write!(f, "{name}")
    }
}

/// Everything that can wake the flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// A job was accepted from the job source.
    JobAccepted,
    /// The confirmation gate accepted the named step.
    Confirmed(ConfirmStep),
    /// The gate declined the named step, explicitly or by timeout.
    Declined(ConfirmStep),
    /// The provider accepted a dial request for a leg.
    DialPlaced(Ordinal),
    /// The provider refused a dial request.
    DialFailed(Ordinal, String),
    /// The call-state watcher saw a leg go active for the first time.
    LegConnected(Ordinal),
    /// The watcher saw a leg disconnect.
    LegEnded(Ordinal),
    /// A leg's connect timer elapsed.
    ConnectTimeout(Ordinal),
    /// The second-leg poll loop ran out of attempts.
    PollBudgetExhausted,
    /// The job-wide dead-man timer elapsed.
    OverallTimeout,
    /// The merge algorithm finished; the bool is its soft success flag.
    MergeFinished(bool),
}

/// Side effects the driver must perform after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    RequestConfirmation(ConfirmStep),
    PlaceCall(Ordinal),
    ArmConnectTimer(Ordinal),
    DisarmConnectTimer,
    BeginConnectPoll,
    AttemptMerge,
}

/// The result of evaluating an event against the current state.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Advance to `state` and perform `actions`.
    Next {
        state: CallState,
        actions: Vec<Action>,
    },
    /// The job is done; the driver enters terminal handling.
    Complete(ConferenceOutcome),
    /// The event carries no meaning in the current state (stale reply,
    /// duplicate signal) and is dropped.
    Ignored,
}

/// Pure transition table for the warm-transfer flow.
///
/// All sequencing policy lives here; the orchestrator only executes the
/// actions and feeds events back in. This keeps every timing and failure
/// rule testable without a provider, a gate, or a running clock.
pub struct FlowMachine;

impl FlowMachine {
    /// Compute and apply the next transition for `job` given `event`.
    ///
    /// Stale events (a gate reply for a step the flow has moved past, a
    /// duplicate connect signal, anything arriving after a terminal
    /// state) resolve to `Transition::Ignored`.
    pub fn next(job: &mut CallJob, event: CallEvent) -> Transition {
        use CallState as S;

        if job.state.is_terminal() {
            return Transition::Ignored;
        }

        let transition = match (job.state, &event) {
            // The dead-man timer supersedes everything else.
            (_, CallEvent::OverallTimeout) => {
                Self::fail(FailureReason::OverallTimeout)
            }

            (S::Idle, CallEvent::JobAccepted) => {
                if job.auto_accept {
                    Self::advance(S::DialingFirst, vec![Action::PlaceCall(Ordinal::First)])
                } else {
                    Self::advance(
                        S::AwaitFirstConfirm,
                        vec![Action::RequestConfirmation(ConfirmStep::FirstCall)],
                    )
                }
            }

            (S::AwaitFirstConfirm, CallEvent::Confirmed(ConfirmStep::FirstCall)) => {
                Self::advance(S::DialingFirst, vec![Action::PlaceCall(Ordinal::First)])
            }
            (S::AwaitFirstConfirm, CallEvent::Declined(ConfirmStep::FirstCall)) => {
                // Declined before anything was dialed; no call is ever placed.
                Self::fail(FailureReason::Declined(ConfirmStep::FirstCall))
            }

            (S::DialingFirst, CallEvent::DialPlaced(Ordinal::First)) => Self::advance(
                S::AwaitFirstConnect,
                vec![Action::ArmConnectTimer(Ordinal::First)],
            ),

            (S::AwaitFirstConnect, CallEvent::LegConnected(Ordinal::First)) => {
                if job.auto_accept {
                    Self::advance(
                        S::DialingSecond,
                        vec![Action::DisarmConnectTimer, Action::PlaceCall(Ordinal::Second)],
                    )
                } else {
                    Self::advance(
                        S::AwaitSecondConfirm,
                        vec![
                            Action::DisarmConnectTimer,
                            Action::RequestConfirmation(ConfirmStep::SecondCall),
                        ],
                    )
                }
            }
            (S::AwaitFirstConnect, CallEvent::ConnectTimeout(Ordinal::First)) => {
                Self::fail(FailureReason::NoAnswer(Ordinal::First))
            }

            (S::AwaitSecondConfirm, CallEvent::Confirmed(ConfirmStep::SecondCall)) => {
                Self::advance(S::DialingSecond, vec![Action::PlaceCall(Ordinal::Second)])
            }
            (S::AwaitSecondConfirm, CallEvent::Declined(ConfirmStep::SecondCall)) => {
                Self::fail(FailureReason::Declined(ConfirmStep::SecondCall))
            }

            (S::DialingSecond, CallEvent::DialPlaced(Ordinal::Second)) => {
                Self::advance(S::AwaitSecondConnect, vec![Action::BeginConnectPoll])
            }

            (S::AwaitSecondConnect, CallEvent::LegConnected(Ordinal::Second)) => {
                Self::merge_stage(job.auto_accept)
            }
            // Poll budget spent without a connect: the first leg already
            // succeeded, so proceed and let the merge precondition sort
            // itself out rather than discarding the job.
            (S::AwaitSecondConnect, CallEvent::PollBudgetExhausted) => {
                Self::merge_stage(job.auto_accept)
            }

            (S::AwaitMergeConfirm, CallEvent::Confirmed(ConfirmStep::Merge)) => {
                Self::advance(S::Merging, vec![Action::AttemptMerge])
            }
            // Both parties are already connected; declining the merge
            // leaves the calls separate but the job still succeeded.
            (S::AwaitMergeConfirm, CallEvent::Declined(ConfirmStep::Merge)) => {
                Transition::Complete(ConferenceOutcome::Completed)
            }

            // Merge failure is soft: both parties are reachable either way.
            (S::Merging, CallEvent::MergeFinished(_)) => {
                Transition::Complete(ConferenceOutcome::Completed)
            }

            (S::DialingFirst, CallEvent::DialFailed(Ordinal::First, msg))
            | (S::DialingSecond, CallEvent::DialFailed(Ordinal::Second, msg)) => {
                Self::fail(FailureReason::PlacementFailed(msg.clone()))
            }

            // A leg dropping before the next leg has connected fails the
            // job. Past AWAIT_SECOND_CONNECT both legs have been up, so
            // disconnects are left to the merge precondition check.
            (
                S::AwaitFirstConnect
                | S::AwaitSecondConfirm
                | S::DialingSecond
                | S::AwaitSecondConnect,
                CallEvent::LegEnded(ordinal),
            ) => Self::fail(FailureReason::EarlyDisconnect(*ordinal)),

            _ => Transition::Ignored,
        };

        // Apply the transition to the job, recording history.
        match &transition {
            Transition::Next { state, .. } => {
                job.state_history.push(job.state);
                job.state = *state;
            }
            Transition::Complete(outcome) => {
                job.state_history.push(job.state);
                match outcome {
                    ConferenceOutcome::Completed => {
                        job.state = CallState::Completed;
                        job.status = JobStatus::Completed;
                    }
                    ConferenceOutcome::Failed(_) => {
                        job.state = CallState::Failed;
                        job.status = JobStatus::Failed;
                    }
                }
            }
            Transition::Ignored => {}
        }

        transition
    }

    fn advance(state: CallState, actions: Vec<Action>) -> Transition {
        Transition::Next { state, actions }
    }

    fn fail(reason: FailureReason) -> Transition {
        Transition::Complete(ConferenceOutcome::Failed(reason))
    }

    // Both legs are (presumed) up; merge directly or ask first.
    fn merge_stage(auto_accept: bool) -> Transition {
        if auto_accept {
            Self::advance(CallState::Merging, vec![Action::AttemptMerge])
        } else {
            Self::advance(
                CallState::AwaitMergeConfirm,
                vec![Action::RequestConfirmation(ConfirmStep::Merge)],
            )
        }
    }
}
