use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type RoomId = i64;
pub type MessageId = i64;

/// Experience needed per advisory level step.
pub const XP_PER_LEVEL: i64 = 100;

/// Character mood shown next to a user's messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    #[default]
    Smiling,
    Crying,
}

impl Mood {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mood::Smiling => "smiling",
            Mood::Crying => "crying",
        }
    }
}

impl fmt::Display for Mood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mood {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "smiling" => Ok(Mood::Smiling),
            "crying" => Ok(Mood::Crying),
            other => Err(format!("unknown mood '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub experience_points: i64,
    pub mood: Mood,
    /// Never reset once incremented.
    pub harmful_count: i64,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Advisory level derived from experience; never stored.
    pub fn level(&self) -> i64 {
        level_for(self.experience_points)
    }
}

pub fn level_for(experience_points: i64) -> i64 {
    1 + experience_points.max(0) / XP_PER_LEVEL
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted chat message. `content` is always the purified text;
/// the raw text of a harmful message is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub owner_id: UserId,
    pub content: String,
    /// Owner's mood at send time
    pub mood: Mood,
    /// Owner's experience at send time
    pub experience_points: i64,
    pub is_harmful: bool,
    pub created_at: DateTime<Utc>,
}

/// Gamification stats pushed to clients alongside a new message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserUpdate {
    pub user_id: UserId,
    pub experience_points: i64,
    pub level: i64,
    pub mood: Mood,
    pub harmful_count: i64,
}

impl From<&User> for UserUpdate {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id,
            experience_points: user.experience_points,
            level: user.level(),
            mood: user.mood,
            harmful_count: user.harmful_count,
        }
    }
}
