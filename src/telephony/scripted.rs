//! In-process telephony provider that plays back scripted call timelines.
//!
//! Backs the `demo` command and the orchestrator tests. Each
//! [`place_call`](super::TelephonyProvider::place_call) consumes the next
//! queued script (or a default quick-answer one) and replays its state
//! transitions on the event stream after the scripted delays.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use super::provider::{LegId, LegState, LegStateChange, TelephonyError, TelephonyProvider};

/// One step of a scripted call: wait `after`, then report `state`.
#[derive(Debug, Clone, Copy)]
pub struct ScriptStep {
    pub after: Duration,
    pub state: LegState,
}

impl ScriptStep {
    pub fn new(after: Duration, state: LegState) -> Self {
        Self { after, state }
    }
}

pub struct ScriptedProvider {
    inner: Arc<Inner>,
}

struct Inner {
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    senders: Mutex<Vec<mpsc::UnboundedSender<LegStateChange>>>,
    states: Mutex<HashMap<LegId, LegState>>,
    placed: Mutex<Vec<String>>,
    next_leg: AtomicU64,
    reject_placement: AtomicBool,
    merge_succeeds: AtomicBool,
    merged: AtomicBool,
    merge_attempts: AtomicUsize,
    mute_engagements: AtomicUsize,
    muted: AtomicBool,
}

impl ScriptedProvider {
    /// Provider with no queued scripts; every call answers quickly.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                scripts: Mutex::new(VecDeque::new()),
                senders: Mutex::new(Vec::new()),
                states: Mutex::new(HashMap::new()),
                placed: Mutex::new(Vec::new()),
                next_leg: AtomicU64::new(0),
                reject_placement: AtomicBool::new(false),
                merge_succeeds: AtomicBool::new(true),
                merged: AtomicBool::new(false),
                merge_attempts: AtomicUsize::new(0),
                mute_engagements: AtomicUsize::new(0),
                muted: AtomicBool::new(false),
            }),
        }
    }

    /// Provider whose successive calls ring and then go active after the
    /// given delays, one delay per expected call.
    pub fn answered_after(delays: &[Duration]) -> Self {
        let provider = Self::new();
        for &delay in delays {
            provider.push_script(vec![
                ScriptStep::new(Duration::ZERO, LegState::Dialing),
                ScriptStep::new(Duration::from_millis(300), LegState::Ringing),
                ScriptStep::new(delay.saturating_sub(Duration::from_millis(300)), LegState::Active),
            ]);
        }
        provider
    }

    /// Queue the timeline for the next placed call.
    pub fn push_script(&self, steps: Vec<ScriptStep>) {
        self.inner.scripts.lock().unwrap().push_back(steps);
    }

    /// Make every following `place_call` fail.
    pub fn reject_placements(&self) {
        self.inner.reject_placement.store(true, Ordering::SeqCst);
    }

    /// Control whether a merge request establishes a conference.
    pub fn set_merge_succeeds(&self, succeeds: bool) {
        self.inner.merge_succeeds.store(succeeds, Ordering::SeqCst);
    }

    /// Numbers dialed so far, in order.
    pub fn placed_calls(&self) -> Vec<String> {
        self.inner.placed.lock().unwrap().clone()
    }

    pub fn merge_attempts(&self) -> usize {
        self.inner.merge_attempts.load(Ordering::SeqCst)
    }

    /// How many times the microphone was switched to muted.
    pub fn mute_engagements(&self) -> usize {
        self.inner.mute_engagements.load(Ordering::SeqCst)
    }

    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::SeqCst)
    }

    // Quick-answer timeline used when no script is queued.
    fn default_script() -> Vec<ScriptStep> {
        vec![
            ScriptStep::new(Duration::ZERO, LegState::Dialing),
            ScriptStep::new(Duration::from_millis(400), LegState::Ringing),
            ScriptStep::new(Duration::from_millis(800), LegState::Active),
        ]
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn emit(&self, leg: LegId, state: LegState) {
        self.states.lock().unwrap().insert(leg, state);
        self.senders
            .lock()
            .unwrap()
            .retain(|tx| tx.send(LegStateChange { leg, state }).is_ok());
    }
}

impl TelephonyProvider for ScriptedProvider {
    fn place_call(&self, number: &str) -> Result<LegId, TelephonyError> {
        if self.inner.reject_placement.load(Ordering::SeqCst) {
            return Err(TelephonyError::PlacementRejected(
                "placement disabled by script".into(),
            ));
        }

        let leg = LegId(self.inner.next_leg.fetch_add(1, Ordering::SeqCst) + 1);
        self.inner.placed.lock().unwrap().push(number.to_string());
        self.inner.states.lock().unwrap().insert(leg, LegState::New);

        let steps = self
            .inner
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(Self::default_script);
        debug!(%leg, number, steps = steps.len(), "scripted call placed");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            for step in steps {
                tokio::time::sleep(step.after).await;
                inner.emit(leg, step.state);
            }
        });

        Ok(leg)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<LegStateChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.senders.lock().unwrap().push(tx);
        rx
    }

    fn leg_state(&self, leg: LegId) -> Option<LegState> {
        self.inner.states.lock().unwrap().get(&leg).copied()
    }

    fn merge(&self, a: LegId, b: LegId) -> bool {
        self.inner.merge_attempts.fetch_add(1, Ordering::SeqCst);
        debug!(%a, %b, "merge requested");
        if self.inner.merge_succeeds.load(Ordering::SeqCst) {
            self.inner.merged.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    fn in_conference(&self, a: LegId, b: LegId) -> bool {
        let states = self.inner.states.lock().unwrap();
        self.inner.merged.load(Ordering::SeqCst)
            && states.contains_key(&a)
            && states.contains_key(&b)
    }

    fn set_microphone_muted(&self, muted: bool) {
        if muted && !self.inner.muted.load(Ordering::SeqCst) {
            self.inner.mute_engagements.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.muted.store(muted, Ordering::SeqCst);
    }
}
