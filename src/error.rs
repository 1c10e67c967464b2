use thiserror::Error;

#[derive(Debug, Error)]
pub enum WarmlineError {
    #[error("A conference job is already in flight")]
    JobInFlight,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
