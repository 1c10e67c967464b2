//! One-time terminal-status write-back to the CRM.
//!
//! The invariant everything here serves: exactly one of
//! `completed`/`failed` is reported per job, ever. The [`ReportToken`] is
//! spent before the first delivery attempt, so a racing timer and event
//! can never both report. Delivery itself is fire-and-forget; a failed
//! PATCH is logged and never retried, and never changes the job's
//! already-decided outcome.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::Client;
use serde_json::json;
use tracing::{debug, info, warn};

/// Terminal status accepted by the CRM write-back endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    Completed,
    Failed,
}

impl ReportStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Completed => "completed",
            ReportStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-job idempotence token: an atomic compare-and-clear around the job
/// id. The first `take` yields the id; every later one observes the
/// cleared token and becomes a no-op, with no lock involved.
#[derive(Debug)]
pub struct ReportToken {
    id: i64,
    spent: AtomicBool,
}

impl ReportToken {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            spent: AtomicBool::new(false),
        }
    }

    /// Yields the job id on the first call, `None` ever after.
    pub fn take(&self) -> Option<i64> {
        if self.spent.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(self.id)
        }
    }
}

/// Delivers terminal statuses to the CRM.
pub struct StatusReporter {
    http: Client,
    base_url: String,
    api_key: String,
}

impl StatusReporter {
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

    fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && !self.api_key.is_empty()
    }

    /// Spend the token and, if this was the first report for the job,
    /// deliver it in the background. Never blocks the caller.
    ///
    /// Returns the delivery task handle so tests can await it; callers in
    /// the flow ignore it.
    pub fn dispatch(
        &self,
        token: &ReportToken,
        status: ReportStatus,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let Some(id) = token.take() else {
            debug!("status already reported, skipping duplicate");
            return None;
        };

        if !self.is_configured() {
            warn!(job = id, "cannot report status - no server config");
            return None;
        }

        let http = self.http.clone();
        let url = format!("{}/api/dialer/pending-calls/{id}", self.base_url);
        let api_key = self.api_key.clone();
        Some(tokio::spawn(async move {
            match deliver(&http, &url, &api_key, status).await {
                Ok(()) => info!(job = id, %status, "status reported"),
                // Soft error: logged, not retried.
                Err(e) => warn!(job = id, %status, "status report failed: {e}"),
            }
        }))
    }
}

async fn deliver(
    http: &Client,
    url: &str,
    api_key: &str,
    status: ReportStatus,
) -> Result<(), reqwest::Error> {
    let response = http
        .patch(url)
        .bearer_auth(api_key)
        .json(&json!({ "status": status.as_str() }))
        .send()
        .await?;
    response.error_for_status()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn token_yields_the_id_exactly_once() {
        let token = ReportToken::new(42);
        assert_eq!(token.take(), Some(42));
        assert_eq!(token.take(), None);
        assert_eq!(token.take(), None);
    }

    #[test]
    fn token_race_produces_a_single_winner() {
        let token = Arc::new(ReportToken::new(7));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let token = Arc::clone(&token);
                std::thread::spawn(move || token.take())
            })
            .collect();

        let winners = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn dispatch_patches_the_job_resource() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/api/dialer/pending-calls/42"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_json(json!({ "status": "completed" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let reporter = StatusReporter::new(server.uri(), "sk-test".into());
        let token = ReportToken::new(42);
        let handle = reporter.dispatch(&token, ReportStatus::Completed).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn second_dispatch_is_a_no_op() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/api/dialer/pending-calls/9"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let reporter = StatusReporter::new(server.uri(), "sk-test".into());
        let token = ReportToken::new(9);

        let first = reporter.dispatch(&token, ReportStatus::Failed);
        let second = reporter.dispatch(&token, ReportStatus::Completed);
        assert!(second.is_none());
        first.unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn delivery_failure_is_absorbed() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let reporter = StatusReporter::new(server.uri(), "sk-test".into());
        let token = ReportToken::new(1);
        // Must not panic or retry; the task just logs the failure.
        reporter
            .dispatch(&token, ReportStatus::Failed)
            .unwrap()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unconfigured_reporter_skips_delivery_but_spends_nothing_extra() {
        let reporter = StatusReporter::new(String::new(), String::new());
        let token = ReportToken::new(3);
        assert!(reporter.dispatch(&token, ReportStatus::Completed).is_none());
        // The token was still spent: the job is decided even if delivery
        // was impossible.
        assert_eq!(token.take(), None);
    }
}
