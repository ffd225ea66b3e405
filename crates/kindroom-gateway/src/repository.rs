use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, warn};

use kindroom_db::Database;
use kindroom_db::models::{MessageRow, NewMessageRow, RoomRow, UserRow, UserStatusRow};
use kindroom_types::models::{Message, Mood, Room, RoomId, User, UserId};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),
}

/// New gamification state to write for a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStatusUpdate {
    pub user_id: UserId,
    pub experience_points: i64,
    pub mood: Mood,
    pub harmful_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub room_id: RoomId,
    pub owner_id: UserId,
    /// Purified text
    pub content: String,
    pub mood: Mood,
    pub experience_points: i64,
    pub is_harmful: bool,
}

/// Durable storage as seen by the message pipeline. Each call is atomic;
/// a missing row is reported as `Ok(None)` or `NotFound`, never as `Storage`.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_user(&self, id: UserId) -> Result<Option<User>, RepositoryError>;

    async fn get_room(&self, id: RoomId) -> Result<Option<Room>, RepositoryError>;

    async fn update_user_status(&self, update: UserStatusUpdate) -> Result<User, RepositoryError>;

    async fn create_message(&self, message: NewMessage) -> Result<Message, RepositoryError>;

    /// Write the user update and the message in one unit of work: both are
    /// visible afterwards, or neither is.
    async fn record_message(
        &self,
        update: UserStatusUpdate,
        message: NewMessage,
    ) -> Result<(User, Message), RepositoryError>;

    /// Most recent messages of a room, oldest first.
    async fn recent_messages(
        &self,
        room_id: RoomId,
        limit: u32,
    ) -> Result<Vec<Message>, RepositoryError>;
}

/// [`Repository`] over the SQLite database. Every call runs on the blocking
/// pool so the async runtime never waits on the connection mutex.
#[derive(Clone)]
pub struct SqliteRepository {
    db: Arc<Database>,
}

impl SqliteRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, RepositoryError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                RepositoryError::Storage(anyhow::anyhow!("blocking task failed: {}", e))
            })?
            .map_err(RepositoryError::Storage)
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn get_user(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        let row = self.blocking(move |db| db.get_user(id)).await?;
        Ok(row.map(user_from_row))
    }

    async fn get_room(&self, id: RoomId) -> Result<Option<Room>, RepositoryError> {
        let row = self.blocking(move |db| db.get_room(id)).await?;
        Ok(row.map(room_from_row))
    }

    async fn update_user_status(&self, update: UserStatusUpdate) -> Result<User, RepositoryError> {
        let id = update.user_id;
        let status = status_row(&update);
        self.blocking(move |db| db.update_user_status(&status))
            .await?
            .map(user_from_row)
            .ok_or(RepositoryError::NotFound { entity: "user", id })
    }

    async fn create_message(&self, message: NewMessage) -> Result<Message, RepositoryError> {
        let row = message_row(message);
        let stored = self.blocking(move |db| db.insert_message(&row)).await?;
        Ok(message_from_row(stored))
    }

    async fn record_message(
        &self,
        update: UserStatusUpdate,
        message: NewMessage,
    ) -> Result<(User, Message), RepositoryError> {
        let id = update.user_id;
        let status = status_row(&update);
        let row = message_row(message);
        self.blocking(move |db| db.record_message(&status, &row))
            .await?
            .map(|(user, message)| (user_from_row(user), message_from_row(message)))
            .ok_or(RepositoryError::NotFound { entity: "user", id })
    }

    async fn recent_messages(
        &self,
        room_id: RoomId,
        limit: u32,
    ) -> Result<Vec<Message>, RepositoryError> {
        let rows = self
            .blocking(move |db| db.recent_messages(room_id, limit))
            .await?;
        Ok(rows.into_iter().map(message_from_row).collect())
    }
}

fn status_row(update: &UserStatusUpdate) -> UserStatusRow {
    UserStatusRow {
        id: update.user_id,
        experience_points: update.experience_points,
        mood: update.mood.as_str().to_string(),
        harmful_count: update.harmful_count,
    }
}

fn message_row(message: NewMessage) -> NewMessageRow {
    NewMessageRow {
        room_id: message.room_id,
        owner_id: message.owner_id,
        content: message.content,
        mood: message.mood.as_str().to_string(),
        experience_points: message.experience_points,
        is_harmful: message.is_harmful,
    }
}

fn user_from_row(row: UserRow) -> User {
    User {
        mood: parse_mood(&row.mood, "user", row.id),
        created_at: parse_timestamp(&row.created_at, "user", row.id),
        id: row.id,
        username: row.username,
        experience_points: row.experience_points,
        harmful_count: row.harmful_count,
    }
}

fn room_from_row(row: RoomRow) -> Room {
    Room {
        created_at: parse_timestamp(&row.created_at, "room", row.id),
        id: row.id,
        name: row.name,
    }
}

fn message_from_row(row: MessageRow) -> Message {
    Message {
        mood: parse_mood(&row.mood, "message", row.id),
        created_at: parse_timestamp(&row.created_at, "message", row.id),
        id: row.id,
        room_id: row.room_id,
        owner_id: row.owner_id,
        content: row.content,
        experience_points: row.experience_points,
        is_harmful: row.is_harmful,
    }
}

fn parse_mood(raw: &str, entity: &str, id: i64) -> Mood {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt mood on {} {}: {}", entity, id, e);
        Mood::default()
    })
}

fn parse_timestamp(raw: &str, entity: &str, id: i64) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite defaults are "YYYY-MM-DD HH:MM:SS" without timezone.
            // Parse as naive UTC and convert.
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt created_at '{}' on {} {}: {}", raw, entity, id, e);
            DateTime::default()
        })
}
