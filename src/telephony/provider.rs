//! Capability surface of the underlying telephony stack.
//!
//! The orchestrator never talks to real telephony directly; it is handed
//! an `Arc<dyn TelephonyProvider>` so tests and the demo can script
//! arbitrary call timelines, including adversarial ones.

use std::fmt;

use thiserror::Error;
use tokio::sync::mpsc;

/// Opaque handle to one provider-side call object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LegId(pub u64);

impl fmt::Display for LegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "leg#{}", self.0)
    }
}

/// Provider-side call states, in the order the stack reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegState {
    New,
    Dialing,
    Ringing,
    Active,
    Holding,
    Disconnected,
}

impl fmt::Display for LegState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LegState::New => "NEW",
            LegState::Dialing => "DIALING",
            LegState::Ringing => "RINGING",
            LegState::Active => "ACTIVE",
            LegState::Holding => "HOLDING",
            LegState::Disconnected => "DISCONNECTED",
        };
        write!(f, "{name}")
    }
}

/// One raw state transition for one leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegStateChange {
    pub leg: LegId,
    pub state: LegState,
}

/// Errors the telephony stack can surface.
///
/// Deliberately small: anything the provider throws mid-call shows up as
/// a `DISCONNECTED` transition on the event stream instead.
#[derive(Debug, Error)]
pub enum TelephonyError {
    /// The stack refused to place an outbound call.
    #[error("call placement rejected: {0}")]
    PlacementRejected(String),
}

/// What the orchestrator needs from a telephony stack.
///
/// Implementations must deliver each subscriber's events in the order the
/// stack emitted them; the receiver side is the single serialized queue
/// the flow consumes.
pub trait TelephonyProvider: Send + Sync {
    /// Place an outbound call. The returned handle identifies the leg in
    /// the event stream and in later merge requests.
    fn place_call(&self, number: &str) -> Result<LegId, TelephonyError>;

    /// Subscribe to raw per-leg state transitions.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<LegStateChange>;

    /// Last known state of a leg, for poll-driven connection checks.
    fn leg_state(&self, leg: LegId) -> Option<LegState>;

    /// Ask the stack to merge two legs into a conference. The bool only
    /// says the command was issued; use [`in_conference`](Self::in_conference)
    /// to verify.
    fn merge(&self, a: LegId, b: LegId) -> bool;

    /// Whether the stack currently reports the two legs in one conference.
    fn in_conference(&self, a: LegId, b: LegId) -> bool;

    /// Mute or unmute the local microphone.
    fn set_microphone_muted(&self, muted: bool);
}
