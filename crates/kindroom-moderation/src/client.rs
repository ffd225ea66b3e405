use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use kindroom_types::models::UserId;
use kindroom_types::moderation::{Escalation, Verdict};

use crate::Moderator;
use crate::error::ModerationError;
use crate::processed::{ProcessTextResponse, build_verdict};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Clone)]
pub struct ModerationConfig {
    /// Base URL serving `POST /process_text`
    pub moderation_url: String,
    /// Base URL serving `POST /process_chat_data`. Escalation is off when unset.
    pub escalation_url: Option<String>,
    pub api_key: String,
    pub api_key_header: String,
    pub timeout: Duration,
}

impl ModerationConfig {
    pub fn new(moderation_url: impl Into<String>) -> Self {
        Self {
            moderation_url: moderation_url.into(),
            escalation_url: None,
            api_key: String::new(),
            api_key_header: DEFAULT_API_KEY_HEADER.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Serialize)]
struct ProcessTextRequest<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct ChatDataRequest<'a> {
    user_id: UserId,
    original_text: &'a str,
    processed_text: &'a str,
}

/// [`Moderator`] backed by the moderation service's HTTP API.
pub struct HttpModerator {
    client: Client,
    config: ModerationConfig,
}

impl HttpModerator {
    pub fn new(config: ModerationConfig) -> Result<Self, ModerationError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ModerationError::Transport)?;
        Ok(Self { client, config })
    }

    fn endpoint(base: &str, path: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl Moderator for HttpModerator {
    async fn moderate(&self, text: &str) -> Result<Verdict, ModerationError> {
        let url = Self::endpoint(&self.config.moderation_url, "process_text");

        let response: ProcessTextResponse = self
            .client
            .post(&url)
            .json(&ProcessTextRequest { text })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                warn!(error = %e, "Moderation request failed");
                ModerationError::from(e)
            })?
            .json()
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to parse moderation response");
                ModerationError::from(e)
            })?;

        let verdict = build_verdict(text, response);
        debug!(
            harmful = verdict.harmful,
            flagged = verdict.flagged_terms.len(),
            "Moderation verdict received"
        );
        Ok(verdict)
    }

    async fn request_quiz_and_report(
        &self,
        user_id: UserId,
        original_text: &str,
        processed_text: &str,
    ) -> Result<Escalation, ModerationError> {
        let base = self
            .config
            .escalation_url
            .as_deref()
            .ok_or(ModerationError::NotConfigured)?;
        let url = Self::endpoint(base, "process_chat_data");

        let escalation: Escalation = self
            .client
            .post(&url)
            .header(self.config.api_key_header.as_str(), self.config.api_key.as_str())
            .json(&ChatDataRequest {
                user_id,
                original_text,
                processed_text,
            })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                warn!(error = %e, user_id, "Escalation request failed");
                ModerationError::from(e)
            })?
            .json()
            .await
            .map_err(|e| {
                warn!(error = %e, user_id, "Failed to parse escalation response");
                ModerationError::from(e)
            })?;

        debug!(
            user_id,
            quizzes = escalation.quiz_results.len(),
            "Escalation data received"
        );
        Ok(escalation)
    }
}
