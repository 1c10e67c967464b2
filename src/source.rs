//! Polled job source: the CRM's pending-calls queue.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::WarmlineError;

/// A pending conference job as served by the CRM.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PendingCall {
    pub id: i64,
    /// First party: the internal team member to bring on the line first.
    pub team_member_number: String,
    /// Second party: the prospect.
    pub contact_number: String,
}

#[derive(Debug, Deserialize)]
struct PendingCallsResponse {
    calls: Vec<PendingCall>,
}

/// Fetches pending jobs from the CRM queue.
pub struct JobSource {
    http: Client,
    base_url: String,
    api_key: String,
}

impl JobSource {
    pub fn new(base_url: String, api_key: String) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && !self.api_key.is_empty()
    }

    /// One poll cycle: fetch the queue and return its first entry, if
    /// any. Only one job is acted on per cycle; the rest stay queued
    /// until the current flow finishes.
    ///
    /// Transport and server errors are absorbed into `Ok(None)` with a
    /// warning; polling must survive a flaky backend.
    pub async fn fetch_pending(&self) -> Result<Option<PendingCall>, WarmlineError> {
        if !self.is_configured() {
            debug!("job source not configured, skipping poll");
            return Ok(None);
        }

        let url = format!("{}/api/dialer/pending-calls", self.base_url);
        let response = match self.http.get(&url).bearer_auth(&self.api_key).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("poll failed: {e}");
                return Ok(None);
            }
        };

        if !response.status().is_success() {
            warn!(status = %response.status(), "poll rejected by server");
            return Ok(None);
        }

        let body: PendingCallsResponse = response.json().await?;
        Ok(body.calls.into_iter().next())
    }
}
