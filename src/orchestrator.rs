//! Drives a warm-transfer job through the full call flow.
//!
//! All policy lives in [`FlowMachine`]; this module owns the clock and
//! the collaborators. One `select!` loop per job consumes the provider's
//! event stream, the gate's replies and every timer, so the machine never
//! observes two events concurrently. The job-wide dead-man timer is armed
//! for the whole loop and supersedes whatever sub-state is active.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, info, warn};

use crate::confirm::{ConfirmationGate, ConfirmationRequest, Decision};
use crate::error::WarmlineError;
use crate::report::{ReportStatus, ReportToken, StatusReporter};
use crate::state_machine::{
    Action, CallEvent, CallJob, CallState, CallWatcher, ConferenceOutcome, ConfirmStep,
    FlowMachine, FlowReport, FlowTiming, JobStatus, LegSignal, Ordinal, Transition,
};
use crate::status::LiveStatus;
use crate::telephony::{LegState, LegStateChange, TelephonyProvider};

pub struct ConferenceOrchestrator {
    provider: Arc<dyn TelephonyProvider>,
    gate: Arc<dyn ConfirmationGate>,
    reporter: Arc<StatusReporter>,
    live: LiveStatus,
    timing: FlowTiming,
    busy: AtomicBool,
}

/// Mutable per-job scheduling state: one optional deadline per timer kind
/// plus the second-leg poll budget.
struct Timers {
    overall_deadline: Instant,
    /// Sentinel deadline for disarmed select branches; past the job's
    /// lifetime by construction.
    never: Instant,
    connect: Option<(Ordinal, Instant)>,
    confirm: Option<(ConfirmStep, Instant)>,
    /// The step a gate reply is currently valid for; anything else is stale.
    awaiting: Option<ConfirmStep>,
    polling: bool,
    poll_attempts: u32,
    next_poll: Instant,
}

impl ConferenceOrchestrator {
    pub fn new(
        provider: Arc<dyn TelephonyProvider>,
        gate: Arc<dyn ConfirmationGate>,
        reporter: Arc<StatusReporter>,
        live: LiveStatus,
        timing: FlowTiming,
    ) -> Self {
        Self {
            provider,
            gate,
            reporter,
            live,
            timing,
            busy: AtomicBool::new(false),
        }
    }

    /// Run one job to its terminal state and report it exactly once.
    ///
    /// At most one job is in flight at a time; a second acceptance while
    /// one is running is refused.
    pub async fn run_job(&self, mut job: CallJob) -> Result<FlowReport, WarmlineError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(WarmlineError::JobInFlight);
        }
        job.status = JobStatus::InProgress;
        let outcome = self.drive(&mut job).await;
        self.busy.store(false, Ordering::SeqCst);
        Ok(FlowReport::from_job(&job, outcome))
    }

    async fn drive(&self, job: &mut CallJob) -> ConferenceOutcome {
        info!(
            job = job.id,
            first = %job.first_party,
            second = %job.second_party,
            auto = job.auto_accept,
            "conference flow started"
        );
        self.live.log(format!("Job #{} accepted", job.id));

        let token = ReportToken::new(job.id);
        let mut watcher = CallWatcher::new();
        let mut raw_events = self.provider.subscribe();
        let (gate_tx, mut gate_rx) = mpsc::unbounded_channel::<(ConfirmStep, Decision)>();

        let now = Instant::now();
        let mut timers = Timers {
            overall_deadline: now + self.timing.overall_timeout,
            never: now + self.timing.overall_timeout + Duration::from_secs(3600),
            connect: None,
            confirm: None,
            awaiting: None,
            polling: false,
            poll_attempts: 0,
            next_poll: now,
        };

        let mut queue: VecDeque<CallEvent> = VecDeque::from([CallEvent::JobAccepted]);

        let outcome = loop {
            let event = match queue.pop_front() {
                Some(event) => event,
                None => {
                    match self
                        .next_wake(job, &mut raw_events, &mut gate_rx, &mut watcher, &mut timers)
                        .await
                    {
                        Some(event) => event,
                        None => continue,
                    }
                }
            };

            match FlowMachine::next(job, event) {
                Transition::Next { state, actions } => {
                    self.live.transition(state);
                    sync_timers(state, &mut timers);
                    for action in actions {
                        self.perform(action, job, &mut watcher, &mut timers, &mut queue, &gate_tx)
                            .await;
                    }
                }
                Transition::Complete(outcome) => break outcome,
                Transition::Ignored => {}
            }
        };

        // Terminal entry: spend the token before any other side effect so
        // nothing can ever produce a second report for this job.
        let status = match &outcome {
            ConferenceOutcome::Completed => ReportStatus::Completed,
            ConferenceOutcome::Failed(reason) => {
                warn!(job = job.id, %reason, "conference flow failed");
                self.live.failed(&reason.to_string());
                ReportStatus::Failed
            }
        };
        self.reporter.dispatch(&token, status);

        // Timers die with this scope. Release per-job tracking and undo
        // side effects before the next job.
        watcher.clear();
        self.provider.set_microphone_muted(false);
        self.live.transition(job.state);
        self.live.idle();
        info!(job = job.id, %outcome, "conference flow finished");
        outcome
    }

    /// Block until something wakes the flow, translating it into a
    /// machine event. `None` means the wake-up carried no new meaning
    /// (duplicate transition, stale reply, unconnected poll sample).
    async fn next_wake(
        &self,
        job: &CallJob,
        raw_events: &mut mpsc::UnboundedReceiver<LegStateChange>,
        gate_rx: &mut mpsc::UnboundedReceiver<(ConfirmStep, Decision)>,
        watcher: &mut CallWatcher,
        timers: &mut Timers,
    ) -> Option<CallEvent> {
        let connect_at = timers.connect.map_or(timers.never, |(_, at)| at);
        let confirm_at = timers.confirm.map_or(timers.never, |(_, at)| at);
        let poll_at = if timers.polling {
            timers.next_poll
        } else {
            timers.never
        };

        tokio::select! {
            _ = sleep_until(timers.overall_deadline) => Some(CallEvent::OverallTimeout),

            Some(change) = raw_events.recv() => {
                let signal = watcher.ingest(change)?;
                Some(self.signal_event(job, signal))
            }

            Some((step, decision)) = gate_rx.recv() => {
                if timers.awaiting != Some(step) {
                    debug!(%step, "stale gate reply ignored");
                    return None;
                }
                timers.awaiting = None;
                timers.confirm = None;
                match decision {
                    Decision::Accepted => Some(CallEvent::Confirmed(step)),
                    Decision::Declined => Some(CallEvent::Declined(step)),
                }
            }

            _ = sleep_until(connect_at), if timers.connect.is_some() => {
                timers.connect.take().map(|(ordinal, _)| CallEvent::ConnectTimeout(ordinal))
            }

            _ = sleep_until(confirm_at), if timers.confirm.is_some() => {
                timers.confirm.take().map(|(step, _)| {
                    timers.awaiting = None;
                    self.live.log(format!("No response - auto-declining {step}"));
                    CallEvent::Declined(step)
                })
            }

            _ = sleep_until(poll_at), if timers.polling => {
                timers.poll_attempts += 1;
                if timers.poll_attempts > self.timing.second_poll_attempts {
                    timers.polling = false;
                    self.live.log("Second call didn't connect - proceeding anyway");
                    return Some(CallEvent::PollBudgetExhausted);
                }
                timers.next_poll = Instant::now() + self.timing.second_poll_interval;
                self.sample_second_leg(job, watcher, timers.poll_attempts)
            }
        }
    }

    // Poll fallback for stacks without a reliable per-leg event. Routed
    // through the watcher so the exactly-once connect guarantee also
    // covers this path.
    fn sample_second_leg(
        &self,
        job: &CallJob,
        watcher: &mut CallWatcher,
        attempt: u32,
    ) -> Option<CallEvent> {
        let leg = watcher.handle(Ordinal::Second)?;
        if self.provider.leg_state(leg) != Some(LegState::Active) {
            debug!(attempt, "second call not connected yet");
            return None;
        }
        let signal = watcher.ingest(LegStateChange {
            leg,
            state: LegState::Active,
        })?;
        Some(self.signal_event(job, signal))
    }

    fn signal_event(&self, job: &CallJob, signal: LegSignal) -> CallEvent {
        match signal {
            LegSignal::Connected(ordinal) => {
                self.live.connected(job.number_for(ordinal));
                CallEvent::LegConnected(ordinal)
            }
            LegSignal::Ended(ordinal) => {
                self.live.log(format!("{ordinal} call ended"));
                CallEvent::LegEnded(ordinal)
            }
        }
    }

    async fn perform(
        &self,
        action: Action,
        job: &CallJob,
        watcher: &mut CallWatcher,
        timers: &mut Timers,
        queue: &mut VecDeque<CallEvent>,
        gate_tx: &mpsc::UnboundedSender<(ConfirmStep, Decision)>,
    ) {
        match action {
            Action::RequestConfirmation(step) => {
                let subject = match step {
                    ConfirmStep::FirstCall => job.first_party.clone(),
                    ConfirmStep::SecondCall | ConfirmStep::Merge => job.second_party.clone(),
                };
                self.live.update(format!("Awaiting confirmation: {step}"));
                self.live
                    .log(format!("Confirmation requested for {step} ({subject})"));

                let (reply_tx, reply_rx) = oneshot::channel();
                let forward = gate_tx.clone();
                tokio::spawn(async move {
                    if let Ok(decision) = reply_rx.await {
                        let _ = forward.send((step, decision));
                    }
                });
                self.gate.request(
                    ConfirmationRequest {
                        step,
                        subject_number: subject,
                        timeout: self.timing.confirm_timeout,
                    },
                    reply_tx,
                );
                timers.awaiting = Some(step);
                timers.confirm = Some((step, Instant::now() + self.timing.confirm_timeout));
            }

            Action::PlaceCall(ordinal) => {
                if ordinal == Ordinal::Second {
                    // Give the stack a beat after the first connect
                    // before taking a second call.
                    sleep(self.timing.settle_delay).await;
                }
                let number = job.number_for(ordinal);
                self.live.calling(number);
                match self.provider.place_call(number) {
                    Ok(leg) => {
                        watcher.register(leg);
                        debug!(job = job.id, %ordinal, %leg, "call placed");
                        queue.push_back(CallEvent::DialPlaced(ordinal));
                    }
                    Err(e) => {
                        warn!(job = job.id, %ordinal, "place_call failed: {e}");
                        queue.push_back(CallEvent::DialFailed(ordinal, e.to_string()));
                    }
                }
            }

            Action::ArmConnectTimer(ordinal) => {
                timers.connect =
                    Some((ordinal, Instant::now() + self.timing.first_connect_timeout));
            }

            Action::DisarmConnectTimer => timers.connect = None,

            Action::BeginConnectPoll => {
                timers.polling = true;
                timers.poll_attempts = 0;
                timers.next_poll = Instant::now() + self.timing.second_poll_interval;
            }

            Action::AttemptMerge => {
                let merged = self.merge_legs(watcher).await;
                queue.push_back(CallEvent::MergeFinished(merged));
            }
        }
    }

    /// Merge algorithm: precondition check, primary merge, delayed
    /// verification with a single retry, then mute so the two remote
    /// parties hear only each other and not the orchestrating device.
    async fn merge_legs(&self, watcher: &CallWatcher) -> bool {
        // The stack needs a moment after the second connect before it
        // will accept a merge.
        sleep(self.timing.merge_delay).await;

        let (Some(a), Some(b)) = (
            watcher.handle(Ordinal::First),
            watcher.handle(Ordinal::Second),
        ) else {
            self.live.log("Merge skipped - a call leg is gone");
            return false;
        };
        if !watcher.both_active() {
            self.live.log("Merge skipped - both calls are not active");
            return false;
        }

        self.live.merging();
        self.provider.merge(a, b);

        sleep(self.timing.merge_verify_delay).await;
        let mut conferenced = self.provider.in_conference(a, b);
        if !conferenced {
            debug!("conference not reported yet - retrying merge once");
            self.provider.merge(a, b);
            sleep(self.timing.merge_verify_delay).await;
            conferenced = self.provider.in_conference(a, b);
        }

        if conferenced {
            self.provider.set_microphone_muted(true);
            self.live.conference_active();
        } else {
            warn!("merge failed - calls remain separate");
            self.live.log("Merge failed - calls remain separate");
        }
        conferenced
    }
}

// Timers that belong to a state are dropped when any other path exits it.
fn sync_timers(state: CallState, timers: &mut Timers) {
    if state != CallState::AwaitSecondConnect {
        timers.polling = false;
    }
    if !matches!(
        state,
        CallState::AwaitFirstConfirm
            | CallState::AwaitSecondConfirm
            | CallState::AwaitMergeConfirm
    ) {
        timers.confirm = None;
        timers.awaiting = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::ScriptedGate;
    use crate::state_machine::FailureReason;
    use crate::telephony::{ScriptStep, ScriptedProvider};

    fn orchestrator(
        provider: Arc<ScriptedProvider>,
        gate: Arc<dyn ConfirmationGate>,
        timing: FlowTiming,
    ) -> ConferenceOrchestrator {
        ConferenceOrchestrator::new(
            provider,
            gate,
            Arc::new(StatusReporter::new(String::new(), String::new())),
            LiveStatus::new(),
            timing,
        )
    }

    fn job(auto_accept: bool) -> CallJob {
        CallJob::new(1, "+15550100".into(), "+15550199".into(), auto_accept)
    }

    #[tokio::test(start_paused = true)]
    async fn auto_accept_happy_path_merges_and_mutes_once() {
        let provider = Arc::new(ScriptedProvider::answered_after(&[
            Duration::from_secs(2),
            Duration::from_secs(5),
        ]));
        let orch = orchestrator(
            provider.clone(),
            Arc::new(ScriptedGate::accept_all()),
            FlowTiming::default(),
        );

        let report = orch.run_job(job(true)).await.unwrap();

        assert_eq!(report.outcome, ConferenceOutcome::Completed);
        assert!(report.state_transitions.contains(&CallState::Merging));
        assert_eq!(provider.placed_calls(), ["+15550100", "+15550199"]);
        assert!(provider.merge_attempts() >= 1);
        assert_eq!(provider.mute_engagements(), 1);
        // Terminal cleanup unmutes the orchestrating device.
        assert!(!provider.is_muted());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_first_call_never_dials_the_second() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_script(vec![
            ScriptStep::new(Duration::ZERO, LegState::Dialing),
            ScriptStep::new(Duration::from_millis(500), LegState::Ringing),
        ]);
        let orch = orchestrator(
            provider.clone(),
            Arc::new(ScriptedGate::accept_all()),
            FlowTiming::default(),
        );

        let report = orch.run_job(job(true)).await.unwrap();

        assert_eq!(
            report.outcome,
            ConferenceOutcome::Failed(FailureReason::NoAnswer(Ordinal::First))
        );
        assert_eq!(provider.placed_calls(), ["+15550100"]);
        assert_eq!(provider.merge_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_man_timer_fails_a_stuck_job() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_script(vec![ScriptStep::new(Duration::ZERO, LegState::Active)]);
        // Second call rings forever and never produces another event.
        provider.push_script(vec![ScriptStep::new(Duration::ZERO, LegState::Dialing)]);

        let timing = FlowTiming {
            overall_timeout: Duration::from_secs(20),
            second_poll_attempts: 1_000,
            ..FlowTiming::default()
        };
        let orch = orchestrator(provider.clone(), Arc::new(ScriptedGate::accept_all()), timing);

        let report = orch.run_job(job(true)).await.unwrap();

        assert_eq!(
            report.outcome,
            ConferenceOutcome::Failed(FailureReason::OverallTimeout)
        );
        // No late side effects after job end.
        assert_eq!(provider.merge_attempts(), 0);
        assert!(!provider.is_muted());
    }

    #[tokio::test(start_paused = true)]
    async fn merge_decline_completes_without_merging() {
        let provider = Arc::new(ScriptedProvider::answered_after(&[
            Duration::from_secs(1),
            Duration::from_secs(1),
        ]));
        let gate = ScriptedGate::with_script(
            vec![Decision::Accepted, Decision::Accepted, Decision::Declined],
            Decision::Declined,
        );
        let orch = orchestrator(provider.clone(), Arc::new(gate), FlowTiming::default());

        let report = orch.run_job(job(false)).await.unwrap();

        assert_eq!(report.outcome, ConferenceOutcome::Completed);
        assert!(report.state_transitions.contains(&CallState::AwaitMergeConfirm));
        assert_eq!(provider.merge_attempts(), 0);
        assert_eq!(provider.mute_engagements(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn first_decline_places_no_calls() {
        let provider = Arc::new(ScriptedProvider::new());
        let gate = ScriptedGate::with_script(vec![Decision::Declined], Decision::Declined);
        let orch = orchestrator(provider.clone(), Arc::new(gate), FlowTiming::default());

        let report = orch.run_job(job(false)).await.unwrap();

        assert_eq!(
            report.outcome,
            ConferenceOutcome::Failed(FailureReason::Declined(ConfirmStep::FirstCall))
        );
        assert!(provider.placed_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_gate_is_auto_declined() {
        let provider = Arc::new(ScriptedProvider::new());
        let orch = orchestrator(
            provider.clone(),
            Arc::new(ScriptedGate::unresponsive()),
            FlowTiming::default(),
        );

        let report = orch.run_job(job(false)).await.unwrap();

        assert_eq!(
            report.outcome,
            ConferenceOutcome::Failed(FailureReason::Declined(ConfirmStep::FirstCall))
        );
        assert!(provider.placed_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_leg_poll_exhaustion_still_completes() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_script(vec![ScriptStep::new(Duration::ZERO, LegState::Active)]);
        provider.push_script(vec![ScriptStep::new(Duration::ZERO, LegState::Dialing)]);

        let timing = FlowTiming {
            second_poll_attempts: 3,
            ..FlowTiming::default()
        };
        let orch = orchestrator(provider.clone(), Arc::new(ScriptedGate::accept_all()), timing);

        let report = orch.run_job(job(true)).await.unwrap();

        // Chosen policy: the first leg succeeded, so the job completes
        // even though the second leg was never seen active.
        assert_eq!(report.outcome, ConferenceOutcome::Completed);
        // The merge precondition failed soft: no merge, no mute.
        assert_eq!(provider.merge_attempts(), 0);
        assert_eq!(provider.mute_engagements(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_leg_disconnect_fails_early() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_script(vec![ScriptStep::new(Duration::ZERO, LegState::Active)]);
        provider.push_script(vec![
            ScriptStep::new(Duration::ZERO, LegState::Dialing),
            ScriptStep::new(Duration::from_secs(1), LegState::Disconnected),
        ]);
        let orch = orchestrator(
            provider.clone(),
            Arc::new(ScriptedGate::accept_all()),
            FlowTiming::default(),
        );

        let report = orch.run_job(job(true)).await.unwrap();

        assert_eq!(
            report.outcome,
            ConferenceOutcome::Failed(FailureReason::EarlyDisconnect(Ordinal::Second))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn placement_failure_fails_fast() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.reject_placements();
        let orch = orchestrator(
            provider.clone(),
            Arc::new(ScriptedGate::accept_all()),
            FlowTiming::default(),
        );

        let report = orch.run_job(job(true)).await.unwrap();

        assert!(matches!(
            report.outcome,
            ConferenceOutcome::Failed(FailureReason::PlacementFailed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_merge_is_soft_and_skips_the_mute() {
        let provider = Arc::new(ScriptedProvider::answered_after(&[
            Duration::from_secs(1),
            Duration::from_secs(1),
        ]));
        provider.set_merge_succeeds(false);
        let orch = orchestrator(
            provider.clone(),
            Arc::new(ScriptedGate::accept_all()),
            FlowTiming::default(),
        );

        let report = orch.run_job(job(true)).await.unwrap();

        assert_eq!(report.outcome, ConferenceOutcome::Completed);
        // Primary attempt plus exactly one verification retry.
        assert_eq!(provider.merge_attempts(), 2);
        assert_eq!(provider.mute_engagements(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_orchestrator_rejects_a_second_job() {
        let provider = Arc::new(ScriptedProvider::answered_after(&[
            Duration::from_secs(2),
            Duration::from_secs(2),
        ]));
        let orch = Arc::new(orchestrator(
            provider,
            Arc::new(ScriptedGate::accept_all()),
            FlowTiming::default(),
        ));

        let first = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.run_job(job(true)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = orch.run_job(job(true)).await;
        assert!(matches!(second, Err(WarmlineError::JobInFlight)));

        let report = first.await.unwrap().unwrap();
        assert_eq!(report.outcome, ConferenceOutcome::Completed);
    }
}
