use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use kindroom_moderation::Moderator;
use kindroom_types::events::{ClientEnvelope, ErrorKind, ServerEvent};
use kindroom_types::models::{Message, RoomId, User, UserId, UserUpdate};
use kindroom_types::moderation::{Escalation, Verdict, empty_object};

use crate::gamification::{self, DEFAULT_HARMFUL_THRESHOLD, UserState};
use crate::locks::UserLocks;
use crate::registry::{BroadcastReport, ConnId, RoomRegistry};
use crate::repository::{NewMessage, Repository, RepositoryError, UserStatusUpdate};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Harmful-message count at which escalation starts
    pub harmful_threshold: i64,
    /// Whether the sending connection receives its own `new_message`
    pub echo_to_sender: bool,
    /// Upper bound on load + escalate + persist for one message
    pub operation_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            harmful_threshold: DEFAULT_HARMFUL_THRESHOLD,
            echo_to_sender: true,
            operation_timeout: Duration::from_secs(30),
        }
    }
}

/// Which connection an envelope arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionCtx {
    pub conn_id: ConnId,
    pub room_id: RoomId,
}

#[derive(Debug)]
pub enum Outcome {
    /// `join_room` acknowledged; nothing else happened
    Joined,
    /// Message persisted and broadcast
    Delivered {
        message: Message,
        report: BroadcastReport,
    },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed envelope: {0}")]
    Protocol(String),

    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("could not persist message: {0}")]
    Persistence(#[source] RepositoryError),

    #[error("message processing timed out after {0:?}")]
    Timeout(Duration),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Protocol(_) => ErrorKind::Protocol,
            PipelineError::UserNotFound(_) => ErrorKind::NotFound,
            PipelineError::Persistence(_) => ErrorKind::Persistence,
            PipelineError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// Event reported back to the sending connection only.
    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::Error {
            kind: self.kind(),
            detail: self.to_string(),
        }
    }
}

/// What the locked section hands back to the broadcast stage.
struct Committed {
    user: User,
    message: Message,
    escalation: Escalation,
}

/// Moderates, scores, stores and fans out chat messages.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    repo: Arc<dyn Repository>,
    moderator: Arc<dyn Moderator>,
    registry: RoomRegistry,
    locks: UserLocks,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        repo: Arc<dyn Repository>,
        moderator: Arc<dyn Moderator>,
        registry: RoomRegistry,
        config: PipelineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                repo,
                moderator,
                registry,
                locks: UserLocks::new(),
                config,
            }),
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.inner.registry
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.inner.repo
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Decode one inbound text frame and run it through the pipeline.
    pub async fn handle_text(
        &self,
        ctx: &ConnectionCtx,
        raw: &str,
    ) -> Result<Outcome, PipelineError> {
        let envelope: ClientEnvelope =
            serde_json::from_str(raw).map_err(|e| PipelineError::Protocol(e.to_string()))?;

        match envelope {
            ClientEnvelope::JoinRoom { sender_id } => {
                debug!(conn_id = %ctx.conn_id, room_id = ctx.room_id, ?sender_id, "join_room acknowledged");
                Ok(Outcome::Joined)
            }
            ClientEnvelope::Message { content, sender_id } => {
                self.process_message(ctx, sender_id, &content).await
            }
        }
    }

    pub async fn process_message(
        &self,
        ctx: &ConnectionCtx,
        sender_id: UserId,
        content: &str,
    ) -> Result<Outcome, PipelineError> {
        if content.trim().is_empty() {
            return Err(PipelineError::Protocol("content must not be empty".into()));
        }

        // Fail open: an unreachable moderator lets the text through unchanged.
        let verdict = match self.inner.moderator.moderate(content).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(error = %e, sender_id, "Moderation unavailable, passing message through");
                Verdict::pass_through(content)
            }
        };

        let timeout = self.inner.config.operation_timeout;
        let committed = tokio::time::timeout(timeout, self.commit(ctx, sender_id, content, &verdict))
            .await
            .map_err(|_| {
                error!(sender_id, room_id = ctx.room_id, "Message processing timed out");
                PipelineError::Timeout(timeout)
            })??;

        let event = ServerEvent::NewMessage {
            message: committed.message.clone(),
            user_update: UserUpdate::from(&committed.user),
            quiz_results: committed.escalation.quiz_results,
            report_results: committed.escalation.report_results,
        };

        let exclude = (!self.inner.config.echo_to_sender).then_some(ctx.conn_id);
        let report = self.inner.registry.broadcast(ctx.room_id, &event, exclude);

        debug!(
            message_id = committed.message.id,
            room_id = ctx.room_id,
            harmful = committed.message.is_harmful,
            delivered = report.delivered,
            evicted = report.evicted.len(),
            "Message delivered"
        );

        Ok(Outcome::Delivered {
            message: committed.message,
            report,
        })
    }

    /// Load, score, escalate and persist under the sender's lock.
    async fn commit(
        &self,
        ctx: &ConnectionCtx,
        sender_id: UserId,
        original: &str,
        verdict: &Verdict,
    ) -> Result<Committed, PipelineError> {
        let guard = self.inner.locks.acquire(sender_id).await;

        let user = self
            .inner
            .repo
            .get_user(sender_id)
            .await
            .map_err(PipelineError::Persistence)?
            .ok_or(PipelineError::UserNotFound(sender_id))?;

        let (next, annotation) = gamification::apply(&UserState::from(&user), verdict);

        let escalation = if gamification::crosses_threshold(
            &next,
            verdict.harmful,
            self.inner.config.harmful_threshold,
        ) {
            info!(sender_id, harmful_count = next.harmful_count, "Harmful threshold reached, escalating");
            match self
                .inner
                .moderator
                .request_quiz_and_report(sender_id, original, &verdict.purified_text)
                .await
            {
                Ok(escalation) => escalation,
                Err(e) => {
                    warn!(error = %e, sender_id, "Escalation failed, continuing without quiz/report");
                    Escalation::empty()
                }
            }
        } else {
            Escalation {
                message: String::new(),
                quiz_results: verdict.quiz_results.clone().unwrap_or_default(),
                report_results: verdict.report_results.clone().unwrap_or_else(empty_object),
            }
        };

        let update = UserStatusUpdate {
            user_id: sender_id,
            experience_points: next.experience_points,
            mood: next.mood,
            harmful_count: next.harmful_count,
        };
        let message = NewMessage {
            room_id: ctx.room_id,
            owner_id: sender_id,
            content: verdict.purified_text.clone(),
            mood: annotation.mood,
            experience_points: annotation.experience_points,
            is_harmful: annotation.harmful,
        };

        // The write owns the guard: if this future is dropped on timeout, the
        // user stays locked until the write has actually resolved.
        let repo = self.inner.repo.clone();
        let write = tokio::spawn(async move {
            let result = repo.record_message(update, message).await;
            drop(guard);
            result
        });

        let (user, message) = write
            .await
            .map_err(|e| {
                RepositoryError::Storage(anyhow::anyhow!("persist task failed: {}", e))
            })
            .and_then(|result| result)
            .map_err(|e| match e {
                RepositoryError::NotFound { .. } => PipelineError::UserNotFound(sender_id),
                other => {
                    error!(error = %other, sender_id, room_id = ctx.room_id, "Failed to persist message");
                    PipelineError::Persistence(other)
                }
            })?;

        Ok(Committed {
            user,
            message,
            escalation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use kindroom_db::Database;
    use kindroom_db::migrations::GENERAL_ROOM_ID;
    use kindroom_moderation::ModerationError;
    use kindroom_types::models::{Mood, Room};
    use serde_json::json;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use crate::registry::Frame;
    use crate::repository::SqliteRepository;

    /// Returns scripted verdicts and records every call.
    #[derive(Default)]
    struct ScriptedModerator {
        verdicts: Mutex<Vec<Result<Verdict, ModerationError>>>,
        escalation: Mutex<Option<Escalation>>,
        moderate_calls: AtomicUsize,
        escalation_calls: Mutex<Vec<(UserId, String, String)>>,
    }

    impl ScriptedModerator {
        fn with_verdict(self, verdict: Verdict) -> Self {
            self.verdicts.lock().unwrap().push(Ok(verdict));
            self
        }

        fn with_failure(self) -> Self {
            self.verdicts
                .lock()
                .unwrap()
                .push(Err(ModerationError::Timeout));
            self
        }

        fn with_escalation(self, escalation: Escalation) -> Self {
            *self.escalation.lock().unwrap() = Some(escalation);
            self
        }
    }

    #[async_trait]
    impl Moderator for ScriptedModerator {
        async fn moderate(&self, text: &str) -> Result<Verdict, ModerationError> {
            self.moderate_calls.fetch_add(1, Ordering::SeqCst);
            let mut verdicts = self.verdicts.lock().unwrap();
            if verdicts.is_empty() {
                Ok(Verdict::pass_through(text))
            } else {
                verdicts.remove(0)
            }
        }

        async fn request_quiz_and_report(
            &self,
            user_id: UserId,
            original_text: &str,
            processed_text: &str,
        ) -> Result<Escalation, ModerationError> {
            self.escalation_calls.lock().unwrap().push((
                user_id,
                original_text.to_string(),
                processed_text.to_string(),
            ));
            self.escalation
                .lock()
                .unwrap()
                .clone()
                .ok_or(ModerationError::NotConfigured)
        }
    }

    /// Reads work, every write fails.
    struct BrokenWrites {
        inner: SqliteRepository,
    }

    #[async_trait]
    impl Repository for BrokenWrites {
        async fn get_user(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
            self.inner.get_user(id).await
        }

        async fn get_room(&self, id: RoomId) -> Result<Option<Room>, RepositoryError> {
            self.inner.get_room(id).await
        }

        async fn update_user_status(&self, _: UserStatusUpdate) -> Result<User, RepositoryError> {
            Err(RepositoryError::Storage(anyhow::anyhow!("disk full")))
        }

        async fn create_message(&self, _: NewMessage) -> Result<Message, RepositoryError> {
            Err(RepositoryError::Storage(anyhow::anyhow!("disk full")))
        }

        async fn record_message(
            &self,
            _: UserStatusUpdate,
            _: NewMessage,
        ) -> Result<(User, Message), RepositoryError> {
            Err(RepositoryError::Storage(anyhow::anyhow!("disk full")))
        }

        async fn recent_messages(
            &self,
            room_id: RoomId,
            limit: u32,
        ) -> Result<Vec<Message>, RepositoryError> {
            self.inner.recent_messages(room_id, limit).await
        }
    }

    /// Real storage, but every combined write stalls before reaching it.
    struct SlowWrites {
        inner: SqliteRepository,
        delay: Duration,
    }

    #[async_trait]
    impl Repository for SlowWrites {
        async fn get_user(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
            self.inner.get_user(id).await
        }

        async fn get_room(&self, id: RoomId) -> Result<Option<Room>, RepositoryError> {
            self.inner.get_room(id).await
        }

        async fn update_user_status(
            &self,
            update: UserStatusUpdate,
        ) -> Result<User, RepositoryError> {
            self.inner.update_user_status(update).await
        }

        async fn create_message(&self, message: NewMessage) -> Result<Message, RepositoryError> {
            self.inner.create_message(message).await
        }

        async fn record_message(
            &self,
            update: UserStatusUpdate,
            message: NewMessage,
        ) -> Result<(User, Message), RepositoryError> {
            tokio::time::sleep(self.delay).await;
            self.inner.record_message(update, message).await
        }

        async fn recent_messages(
            &self,
            room_id: RoomId,
            limit: u32,
        ) -> Result<Vec<Message>, RepositoryError> {
            self.inner.recent_messages(room_id, limit).await
        }
    }

    fn harmful(purified: &str) -> Verdict {
        Verdict {
            harmful: true,
            purified_text: purified.to_string(),
            flagged_terms: vec!["bad".into()],
            quiz_results: None,
            report_results: None,
        }
    }

    struct Harness {
        pipeline: Pipeline,
        repo: SqliteRepository,
        moderator: Arc<ScriptedModerator>,
    }

    fn harness(moderator: ScriptedModerator, config: PipelineConfig) -> Harness {
        let repo = SqliteRepository::new(Arc::new(Database::open_in_memory().unwrap()));
        let moderator = Arc::new(moderator);
        let pipeline = Pipeline::new(
            Arc::new(repo.clone()),
            moderator.clone(),
            RoomRegistry::new(),
            config,
        );
        Harness {
            pipeline,
            repo,
            moderator,
        }
    }

    impl Harness {
        fn user_with(&self, name: &str, xp: i64, harmful_count: i64) -> UserId {
            let db = self.repo.database();
            let row = db.create_user(name).unwrap();
            db.update_user_status(&kindroom_db::models::UserStatusRow {
                id: row.id,
                experience_points: xp,
                mood: "smiling".into(),
                harmful_count,
            })
            .unwrap();
            row.id
        }

        fn connect(&self) -> (ConnectionCtx, mpsc::Receiver<Frame>) {
            let ctx = ConnectionCtx {
                conn_id: Uuid::new_v4(),
                room_id: GENERAL_ROOM_ID,
            };
            let (tx, rx) = mpsc::channel(16);
            self.pipeline.registry().join(ctx.room_id, ctx.conn_id, tx);
            (ctx, rx)
        }
    }

    fn envelope(sender_id: UserId, content: &str) -> String {
        json!({"type": "message", "content": content, "sender_id": sender_id}).to_string()
    }

    fn next_event(rx: &mut mpsc::Receiver<Frame>) -> ServerEvent {
        serde_json::from_str(&rx.try_recv().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn join_room_changes_nothing() {
        let h = harness(ScriptedModerator::default(), PipelineConfig::default());
        let user = h.user_with("a", 20, 0);
        let (ctx, mut rx) = h.connect();

        for _ in 0..5 {
            let outcome = h
                .pipeline
                .handle_text(&ctx, r#"{"type":"join_room","sender_id":1}"#)
                .await
                .unwrap();
            assert!(matches!(outcome, Outcome::Joined));
        }

        assert!(rx.try_recv().is_err());
        assert_eq!(h.moderator.moderate_calls.load(Ordering::SeqCst), 0);
        let stored = h.repo.get_user(user).await.unwrap().unwrap();
        assert_eq!(stored.experience_points, 20);
        assert!(h.repo.recent_messages(GENERAL_ROOM_ID, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_envelopes_are_protocol_errors() {
        let h = harness(ScriptedModerator::default(), PipelineConfig::default());
        let (ctx, mut rx) = h.connect();

        for raw in [
            "not json",
            r#"{"type":"message","sender_id":1}"#,
            r#"{"type":"message","content":"hi"}"#,
            r#"{"type":"dance"}"#,
            r#"{"type":"message","content":"   ","sender_id":1}"#,
        ] {
            let err = h.pipeline.handle_text(&ctx, raw).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Protocol, "{}", raw);
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_sender_is_not_found_and_not_broadcast() {
        let h = harness(ScriptedModerator::default(), PipelineConfig::default());
        let (ctx, mut rx) = h.connect();

        let err = h.pipeline.handle_text(&ctx, &envelope(999, "hi")).await.unwrap_err();
        assert!(matches!(err, PipelineError::UserNotFound(999)));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn harmful_message_is_purified_and_penalized() {
        let h = harness(
            ScriptedModerator::default().with_verdict(harmful("be kind")),
            PipelineConfig::default(),
        );
        let user = h.user_with("b", 5, 0);
        let (ctx, mut rx) = h.connect();

        let outcome = h.pipeline.handle_text(&ctx, &envelope(user, "you jerk")).await.unwrap();
        let Outcome::Delivered { message, .. } = outcome else {
            panic!("expected delivery");
        };
        assert_eq!(message.content, "be kind");
        assert!(message.is_harmful);
        assert_eq!(message.mood, Mood::Crying);
        assert_eq!(message.experience_points, 0);

        let stored = h.repo.get_user(user).await.unwrap().unwrap();
        assert_eq!(stored.experience_points, 0);
        assert_eq!(stored.mood, Mood::Crying);
        assert_eq!(stored.harmful_count, 1);

        match next_event(&mut rx) {
            ServerEvent::NewMessage { user_update, message, .. } => {
                assert_eq!(user_update.experience_points, 0);
                assert_eq!(user_update.harmful_count, 1);
                assert_eq!(message.content, "be kind");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn moderation_failure_fails_open() {
        let h = harness(ScriptedModerator::default().with_failure(), PipelineConfig::default());
        let user = h.user_with("c", 10, 0);
        let (ctx, mut rx) = h.connect();

        h.pipeline.handle_text(&ctx, &envelope(user, "raw words")).await.unwrap();

        let history = h.repo.recent_messages(GENERAL_ROOM_ID, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "raw words");
        assert!(!history[0].is_harmful);

        match next_event(&mut rx) {
            ServerEvent::NewMessage { user_update, .. } => {
                assert_eq!(user_update.experience_points, 15);
                assert_eq!(user_update.mood, Mood::Smiling);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn persistence_failure_is_reported_and_not_broadcast() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let user = db.create_user("d").unwrap().id;
        let repo = BrokenWrites {
            inner: SqliteRepository::new(db),
        };
        let pipeline = Pipeline::new(
            Arc::new(repo),
            Arc::new(ScriptedModerator::default()),
            RoomRegistry::new(),
            PipelineConfig::default(),
        );
        let ctx = ConnectionCtx {
            conn_id: Uuid::new_v4(),
            room_id: GENERAL_ROOM_ID,
        };
        let (tx, mut rx) = mpsc::channel(4);
        pipeline.registry().join(ctx.room_id, ctx.conn_id, tx);

        let err = pipeline.handle_text(&ctx, &envelope(user, "hello")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Persistence);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn escalation_below_threshold_is_never_called() {
        let h = harness(
            ScriptedModerator::default()
                .with_verdict(harmful("x"))
                .with_escalation(Escalation::empty()),
            PipelineConfig::default(),
        );
        // 8 + 1 = 9 < 10
        let user = h.user_with("e", 50, 8);
        let (ctx, _rx) = h.connect();

        h.pipeline.handle_text(&ctx, &envelope(user, "bad")).await.unwrap();
        assert!(h.moderator.escalation_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn escalation_at_threshold_merges_quiz_and_report() {
        let escalation = Escalation {
            message: "ok".into(),
            quiz_results: vec![json!({"question": "What did you mean?"})],
            report_results: json!({"summary": "ten strikes"}),
        };
        let h = harness(
            ScriptedModerator::default()
                .with_verdict(harmful("clean version"))
                .with_escalation(escalation),
            PipelineConfig::default(),
        );
        // 9 + 1 = 10 reaches the threshold
        let user = h.user_with("f", 50, 9);
        let (ctx, mut rx) = h.connect();

        h.pipeline.handle_text(&ctx, &envelope(user, "raw bad")).await.unwrap();

        let calls = h.moderator.escalation_calls.lock().unwrap().clone();
        assert_eq!(calls, vec![(user, "raw bad".to_string(), "clean version".to_string())]);

        match next_event(&mut rx) {
            ServerEvent::NewMessage {
                quiz_results,
                report_results,
                ..
            } => {
                assert_eq!(quiz_results.len(), 1);
                assert_eq!(report_results["summary"], "ten strikes");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn clean_message_above_threshold_does_not_escalate() {
        let h = harness(
            ScriptedModerator::default().with_escalation(Escalation::empty()),
            PipelineConfig::default(),
        );
        let user = h.user_with("g", 50, 30);
        let (ctx, _rx) = h.connect();

        h.pipeline.handle_text(&ctx, &envelope(user, "nice")).await.unwrap();
        assert!(h.moderator.escalation_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn escalation_failure_still_delivers() {
        // No escalation scripted: the call fails.
        let h = harness(
            ScriptedModerator::default().with_verdict(harmful("calm")),
            PipelineConfig::default(),
        );
        let user = h.user_with("h", 50, 12);
        let (ctx, mut rx) = h.connect();

        h.pipeline.handle_text(&ctx, &envelope(user, "rude")).await.unwrap();
        assert_eq!(h.moderator.escalation_calls.lock().unwrap().len(), 1);

        match next_event(&mut rx) {
            ServerEvent::NewMessage {
                quiz_results,
                report_results,
                user_update,
                ..
            } => {
                assert!(quiz_results.is_empty());
                assert_eq!(report_results, empty_object());
                assert_eq!(user_update.harmful_count, 13);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn sender_echo_follows_config() {
        for echo in [true, false] {
            let config = PipelineConfig {
                echo_to_sender: echo,
                ..Default::default()
            };
            let h = harness(ScriptedModerator::default(), config);
            let user = h.user_with("i", 0, 0);
            let (sender, mut sender_rx) = h.connect();
            let (_other, mut other_rx) = h.connect();

            h.pipeline.handle_text(&sender, &envelope(user, "hey")).await.unwrap();

            assert!(matches!(next_event(&mut other_rx), ServerEvent::NewMessage { .. }));
            assert_eq!(sender_rx.try_recv().is_ok(), echo);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_messages_from_one_user_do_not_lose_updates() {
        let h = harness(ScriptedModerator::default(), PipelineConfig::default());
        let user = h.user_with("j", 0, 0);

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let pipeline = h.pipeline.clone();
            tasks.push(tokio::spawn(async move {
                let ctx = ConnectionCtx {
                    conn_id: Uuid::new_v4(),
                    room_id: GENERAL_ROOM_ID,
                };
                pipeline.handle_text(&ctx, &envelope(user, "hi")).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let stored = h.repo.get_user(user).await.unwrap().unwrap();
        assert_eq!(stored.experience_points, 100);
        assert_eq!(h.repo.recent_messages(GENERAL_ROOM_ID, 50).await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn slow_persist_times_out_without_broadcast() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let user = db.create_user("k").unwrap().id;
        let inner = SqliteRepository::new(db);
        let repo = SlowWrites {
            inner: inner.clone(),
            delay: Duration::from_millis(400),
        };
        let pipeline = Pipeline::new(
            Arc::new(repo),
            Arc::new(ScriptedModerator::default()),
            RoomRegistry::new(),
            PipelineConfig {
                operation_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        );
        let ctx = ConnectionCtx {
            conn_id: Uuid::new_v4(),
            room_id: GENERAL_ROOM_ID,
        };
        let (tx, mut rx) = mpsc::channel(4);
        pipeline.registry().join(ctx.room_id, ctx.conn_id, tx);

        let err = pipeline.handle_text(&ctx, &envelope(user, "hello")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(matches!(err, PipelineError::Timeout(d) if d == Duration::from_millis(100)));
        match err.to_event() {
            ServerEvent::Error { kind, .. } => assert_eq!(kind, ErrorKind::Timeout),
            other => panic!("unexpected event {:?}", other),
        }

        // The abandoned write still holds the user until it lands.
        let early = tokio::time::timeout(
            Duration::from_millis(100),
            pipeline.inner.locks.acquire(user),
        )
        .await;
        assert!(early.is_err());

        let guard = tokio::time::timeout(Duration::from_secs(2), pipeline.inner.locks.acquire(user))
            .await
            .expect("lock released once the write resolved");
        drop(guard);
        assert!(pipeline.inner.locks.is_empty());

        // Stored late, but never broadcast.
        assert_eq!(inner.recent_messages(GENERAL_ROOM_ID, 10).await.unwrap().len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn evicted_recipient_does_not_fail_the_sender() {
        let h = harness(ScriptedModerator::default(), PipelineConfig::default());
        let user = h.user_with("l", 0, 0);
        let (sender, mut sender_rx) = h.connect();
        let (gone, gone_rx) = h.connect();
        drop(gone_rx);

        let outcome = h.pipeline.handle_text(&sender, &envelope(user, "still here")).await;
        let Ok(Outcome::Delivered { message, report }) = outcome else {
            panic!("expected delivery");
        };
        assert_eq!(report.evicted, vec![gone.conn_id]);
        assert_eq!(report.delivered, 1);
        assert!(!h.pipeline.registry().contains(GENERAL_ROOM_ID, gone.conn_id));

        match next_event(&mut sender_rx) {
            ServerEvent::NewMessage { message: got, .. } => {
                assert_eq!(got.id, message.id);
                assert_eq!(got.content, "still here");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
