pub mod provider;
pub mod scripted;

pub use provider::{LegId, LegState, LegStateChange, TelephonyError, TelephonyProvider};
pub use scripted::{ScriptStep, ScriptedProvider};
