//! Live human-readable view of the conference flow.
//!
//! The UI layer consumes two things: a `watch` channel that always holds
//! the latest one-line status, and a bounded ring of timestamped log
//! entries. Exactly one status line is published per state transition;
//! that is the integration contract with whatever front-end renders it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::Local;
use tokio::sync::watch;

use crate::state_machine::CallState;

const MAX_LOG_LINES: usize = 50;
const IDLE_STATUS: &str = "Waiting for calls...";

struct Inner {
    current: watch::Sender<String>,
    entries: Mutex<VecDeque<String>>,
}

/// Clonable handle to the live status stream.
#[derive(Clone)]
pub struct LiveStatus {
    inner: Arc<Inner>,
}

impl LiveStatus {
    pub fn new() -> Self {
        let (current, _) = watch::channel(IDLE_STATUS.to_string());
        Self {
            inner: Arc::new(Inner {
                current,
                entries: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Subscribe to the always-latest status line.
    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.inner.current.subscribe()
    }

    /// Replace the status banner.
    pub fn update(&self, status: impl Into<String>) {
        // send_replace so publishing works with zero subscribers.
        self.inner.current.send_replace(status.into());
    }

    /// Append a timestamped entry to the log ring, newest first.
    pub fn log(&self, message: impl AsRef<str>) {
        let entry = format!("[{}] {}", Local::now().format("%H:%M:%S"), message.as_ref());
        let mut entries = self.inner.entries.lock().unwrap();
        entries.push_front(entry);
        entries.truncate(MAX_LOG_LINES);
    }

    /// Snapshot of the log ring, newest first.
    pub fn entries(&self) -> Vec<String> {
        self.inner.entries.lock().unwrap().iter().cloned().collect()
    }

    /// One line per state transition.
    pub fn transition(&self, state: CallState) {
        self.update(state.to_string());
        self.log(format!("State: {state}"));
    }

    pub fn calling(&self, number: &str) {
        self.update(format!("Calling {number}..."));
        self.log(format!("Initiating call to {number}"));
    }

    pub fn connected(&self, number: &str) {
        self.update(format!("Connected to {number}"));
        self.log(format!("Call connected to {number}"));
    }

    pub fn merging(&self) {
        self.update("Merging calls into conference...");
        self.log("Attempting to merge calls");
    }

    pub fn conference_active(&self) {
        self.update("Conference active - you are muted");
        self.log("Conference created - microphone muted");
    }

    pub fn failed(&self, reason: &str) {
        self.update(format!("Call failed: {reason}"));
        self.log(format!("Call failed: {reason}"));
    }

    pub fn idle(&self) {
        self.update(IDLE_STATUS);
        self.log("Ready for next call");
    }
}

impl Default for LiveStatus {
    fn default() -> Self {
        Self::new()
    }
}
