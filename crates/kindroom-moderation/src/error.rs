use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("moderation request timed out")]
    Timeout,

    #[error("moderation request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("moderation service returned {0}")]
    Status(reqwest::StatusCode),

    #[error("could not decode moderation response: {0}")]
    Decode(#[source] reqwest::Error),

    #[error("escalation service is not configured")]
    NotConfigured,
}

impl From<reqwest::Error> for ModerationError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ModerationError::Timeout
        } else if let Some(status) = e.status() {
            ModerationError::Status(status)
        } else if e.is_decode() {
            ModerationError::Decode(e)
        } else {
            ModerationError::Transport(e)
        }
    }
}
