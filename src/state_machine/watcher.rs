use std::collections::HashMap;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::telephony::{LegId, LegState, LegStateChange};

use super::job::Ordinal;

/// Signal the watcher distills out of the raw provider stream: exactly
/// one `Connected` per leg, ever, and one `Ended` when it drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegSignal {
    Connected(Ordinal),
    Ended(Ordinal),
}

#[derive(Debug)]
struct LegRecord {
    ordinal: Ordinal,
    state: LegState,
    connected_at: Option<Instant>,
}

/// Per-job tracking of call legs.
///
/// Assigns ordinals in arrival order (first leg seen is the first party),
/// keeps the last known provider state per leg, and guarantees the
/// connected signal fires at most once per leg. A resume from hold
/// produces another `ACTIVE` transition that must not re-trigger the flow.
#[derive(Debug, Default)]
pub struct CallWatcher {
    legs: HashMap<LegId, LegRecord>,
    assigned: u8,
}

impl CallWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a leg the orchestrator just dialed. Harmless if the
    /// leg already showed up on the event stream first.
    pub fn register(&mut self, leg: LegId) {
        self.record(leg);
    }

    /// Fold one raw provider transition into the tracked state, returning
    /// the distilled signal if this transition means anything to the flow.
    pub fn ingest(&mut self, change: LegStateChange) -> Option<LegSignal> {
        let ordinal = self.record(change.leg)?;
        let record = self.legs.get_mut(&change.leg)?;
        record.state = change.state;
        debug!(%change.leg, state = %change.state, %ordinal, "leg transition");

        match change.state {
            LegState::Active if record.connected_at.is_none() => {
                record.connected_at = Some(Instant::now());
                Some(LegSignal::Connected(ordinal))
            }
            LegState::Disconnected => {
                self.legs.remove(&change.leg);
                Some(LegSignal::Ended(ordinal))
            }
            _ => None,
        }
    }

    /// Merge precondition: exactly two legs tracked, both active.
    pub fn both_active(&self) -> bool {
        self.legs.len() == 2 && self.legs.values().all(|l| l.state == LegState::Active)
    }

    /// The provider handle of a leg, if it is still tracked.
    pub fn handle(&self, ordinal: Ordinal) -> Option<LegId> {
        self.legs
            .iter()
            .find(|(_, record)| record.ordinal == ordinal)
            .map(|(leg, _)| *leg)
    }

    /// Drop all per-job tracking. Called on terminal-state entry so no
    /// leg entries leak into the next job.
    pub fn clear(&mut self) {
        self.legs.clear();
        self.assigned = 0;
    }

    // Ensure the leg is tracked, assigning the next free ordinal to a new
    // one. Legs beyond the second are not part of any flow we run.
    fn record(&mut self, leg: LegId) -> Option<Ordinal> {
        if let Some(record) = self.legs.get(&leg) {
            return Some(record.ordinal);
        }
        let ordinal = match self.assigned {
            0 => Ordinal::First,
            1 => Ordinal::Second,
            _ => {
                warn!(%leg, "ignoring third call leg");
                return None;
            }
        };
        self.assigned += 1;
        self.legs.insert(
            leg,
            LegRecord {
                ordinal,
                state: LegState::New,
                connected_at: None,
            },
        );
        Some(ordinal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(leg: u64, state: LegState) -> LegStateChange {
        LegStateChange {
            leg: LegId(leg),
            state,
        }
    }

    #[test]
    fn ordinals_follow_arrival_order() {
        let mut watcher = CallWatcher::new();
        assert_eq!(
            watcher.ingest(change(10, LegState::Active)),
            Some(LegSignal::Connected(Ordinal::First))
        );
        assert_eq!(
            watcher.ingest(change(20, LegState::Active)),
            Some(LegSignal::Connected(Ordinal::Second))
        );
        assert_eq!(watcher.handle(Ordinal::First), Some(LegId(10)));
        assert_eq!(watcher.handle(Ordinal::Second), Some(LegId(20)));
    }

    #[test]
    fn connected_fires_exactly_once_per_leg() {
        let mut watcher = CallWatcher::new();
        watcher.ingest(change(1, LegState::Dialing));
        assert_eq!(
            watcher.ingest(change(1, LegState::Active)),
            Some(LegSignal::Connected(Ordinal::First))
        );

        // Hold and resume: a second ACTIVE must not re-fire.
        assert_eq!(watcher.ingest(change(1, LegState::Holding)), None);
        assert_eq!(watcher.ingest(change(1, LegState::Active)), None);

        // An adversarial duplicate ACTIVE is equally silent.
        assert_eq!(watcher.ingest(change(1, LegState::Active)), None);
    }

    #[test]
    fn disconnect_ends_and_forgets_the_leg() {
        let mut watcher = CallWatcher::new();
        watcher.ingest(change(1, LegState::Active));
        assert_eq!(
            watcher.ingest(change(1, LegState::Disconnected)),
            Some(LegSignal::Ended(Ordinal::First))
        );
        assert_eq!(watcher.handle(Ordinal::First), None);
        assert!(!watcher.both_active());
    }

    #[test]
    fn disconnect_without_connect_still_signals_ended() {
        let mut watcher = CallWatcher::new();
        watcher.ingest(change(1, LegState::Dialing));
        watcher.ingest(change(1, LegState::Ringing));
        assert_eq!(
            watcher.ingest(change(1, LegState::Disconnected)),
            Some(LegSignal::Ended(Ordinal::First))
        );
    }

    #[test]
    fn both_active_requires_two_active_legs() {
        let mut watcher = CallWatcher::new();
        watcher.ingest(change(1, LegState::Active));
        assert!(!watcher.both_active());

        watcher.ingest(change(2, LegState::Ringing));
        assert!(!watcher.both_active());

        watcher.ingest(change(2, LegState::Active));
        assert!(watcher.both_active());

        watcher.ingest(change(1, LegState::Holding));
        assert!(!watcher.both_active());
    }

    #[test]
    fn third_leg_is_ignored() {
        let mut watcher = CallWatcher::new();
        watcher.ingest(change(1, LegState::Active));
        watcher.ingest(change(2, LegState::Active));
        assert_eq!(watcher.ingest(change(3, LegState::Active)), None);
        assert!(watcher.both_active());
    }

    #[test]
    fn register_before_events_keeps_ordinal_stable() {
        let mut watcher = CallWatcher::new();
        watcher.register(LegId(5));
        // The event stream mentioning the same leg later must not
        // reassign it.
        assert_eq!(
            watcher.ingest(change(5, LegState::Active)),
            Some(LegSignal::Connected(Ordinal::First))
        );
        watcher.register(LegId(6));
        assert_eq!(watcher.handle(Ordinal::Second), Some(LegId(6)));
    }

    #[test]
    fn clear_resets_for_the_next_job() {
        let mut watcher = CallWatcher::new();
        watcher.ingest(change(1, LegState::Active));
        watcher.ingest(change(2, LegState::Active));
        watcher.clear();

        assert_eq!(watcher.handle(Ordinal::First), None);
        // Ordinal assignment starts over.
        assert_eq!(
            watcher.ingest(change(9, LegState::Active)),
            Some(LegSignal::Connected(Ordinal::First))
        );
    }
}
