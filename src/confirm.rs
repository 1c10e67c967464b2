//! Human-in-the-loop approval before each risky step.
//!
//! The gate is callback-shaped: the orchestrator hands it a oneshot reply
//! sender and keeps its own auto-decline timer, so a stalled gate can
//! never wedge a job. A reply arriving after the flow has moved on finds
//! the sender dropped and is discarded.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use console::Style;
use tokio::sync::oneshot;
use tracing::debug;

use crate::state_machine::ConfirmStep;

/// Outcome of a confirmation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accepted,
    Declined,
}

/// A pending accept/decline prompt for one flow step. At most one is
/// outstanding per job at any time.
#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub step: ConfirmStep,
    /// The number the guarded step will act on.
    pub subject_number: String,
    /// How long the orchestrator waits before synthesizing a decline.
    pub timeout: Duration,
}

pub trait ConfirmationGate: Send + Sync {
    /// Prompt for the given step. Implementations answer through `reply`;
    /// dropping it without answering counts as no response and the
    /// orchestrator's auto-decline timer takes over.
    fn request(&self, req: ConfirmationRequest, reply: oneshot::Sender<Decision>);
}

/// Interactive gate that prompts on the terminal.
pub struct TerminalGate;

impl ConfirmationGate for TerminalGate {
    fn request(&self, req: ConfirmationRequest, reply: oneshot::Sender<Decision>) {
        tokio::task::spawn_blocking(move || {
            let bold = Style::new().cyan().bold();
            eprintln!(
                "  {} {} ({}) - accept? [y/N] (auto-decline in {}s)",
                bold.apply_to("?"),
                req.step,
                req.subject_number,
                req.timeout.as_secs()
            );

            let mut line = String::new();
            let decision = match std::io::stdin().read_line(&mut line) {
                Ok(_) if line.trim().eq_ignore_ascii_case("y") => Decision::Accepted,
                _ => Decision::Declined,
            };
            // The flow may have auto-declined already; a late answer is
            // simply dropped.
            let _ = reply.send(decision);
        });
    }
}

/// Gate that replays a fixed list of decisions, one per request; once the
/// script runs out it keeps answering with the final fallback. Used by
/// the demo command and the orchestrator tests.
pub struct ScriptedGate {
    script: Mutex<VecDeque<Decision>>,
    /// Answer once the script runs out; `None` means stay silent and let
    /// the auto-decline timer fire.
    fallback: Option<Decision>,
}

impl ScriptedGate {
    pub fn with_script(decisions: Vec<Decision>, fallback: Decision) -> Self {
        Self {
            script: Mutex::new(decisions.into()),
            fallback: Some(fallback),
        }
    }

    /// Accept every step.
    pub fn accept_all() -> Self {
        Self::with_script(Vec::new(), Decision::Accepted)
    }

    /// Never answer at all, leaving the auto-decline timer to fire.
    pub fn unresponsive() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: None,
        }
    }
}

impl ConfirmationGate for ScriptedGate {
    fn request(&self, req: ConfirmationRequest, reply: oneshot::Sender<Decision>) {
        let decision = self.script.lock().unwrap().pop_front().or(self.fallback);
        match decision {
            Some(d) => {
                debug!(step = %req.step, ?d, "scripted gate answering");
                let _ = reply.send(d);
            }
            None => drop(reply),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_gate_replays_then_falls_back() {
        let gate = ScriptedGate::with_script(
            vec![Decision::Accepted, Decision::Declined],
            Decision::Accepted,
        );
        let req = ConfirmationRequest {
            step: ConfirmStep::FirstCall,
            subject_number: "+15550100".into(),
            timeout: Duration::from_secs(30),
        };

        for expected in [Decision::Accepted, Decision::Declined, Decision::Accepted] {
            let (tx, rx) = oneshot::channel();
            gate.request(req.clone(), tx);
            assert_eq!(rx.await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn dropped_reply_is_not_an_error() {
        let gate = ScriptedGate::accept_all();
        let (tx, rx) = oneshot::channel();
        drop(rx);
        // Must not panic when the orchestrator has already moved on.
        gate.request(
            ConfirmationRequest {
                step: ConfirmStep::Merge,
                subject_number: "+15550199".into(),
                timeout: Duration::from_secs(30),
            },
            tx,
        );
    }
}
