mod job;
mod state;
mod watcher;

pub use job::{
    CallJob, ConferenceOutcome, ConfirmStep, FailureReason, FlowReport, FlowTiming, JobStatus,
    Ordinal,
};
pub use state::{Action, CallEvent, CallState, FlowMachine, Transition};
pub use watcher::{CallWatcher, LegSignal};
