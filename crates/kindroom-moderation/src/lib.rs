//! Client side of the external moderation service.
//!
//! The service is consumed as a plain request/response boundary: one call
//! judges a chat message, a second (escalation) call produces quiz and report
//! content for users who keep sending harmful messages. Callers decide what a
//! failure means; this crate only reports it.

pub mod client;
pub mod error;
pub mod processed;

use async_trait::async_trait;

use kindroom_types::models::UserId;
use kindroom_types::moderation::{Escalation, Verdict};

pub use client::{HttpModerator, ModerationConfig};
pub use error::ModerationError;
pub use processed::ProcessedText;

#[async_trait]
pub trait Moderator: Send + Sync {
    /// Judge one raw chat message.
    async fn moderate(&self, text: &str) -> Result<Verdict, ModerationError>;

    /// Ask for quiz/report content about a user's harmful message.
    async fn request_quiz_and_report(
        &self,
        user_id: UserId,
        original_text: &str,
        processed_text: &str,
    ) -> Result<Escalation, ModerationError>;
}
