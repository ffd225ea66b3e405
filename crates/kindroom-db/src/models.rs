/// Row types as read from and written to SQLite.
/// Distinct from kindroom-types models to keep the DB layer independent.

pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub experience_points: i64,
    pub mood: String,
    pub harmful_count: i64,
    pub created_at: String,
}

pub struct RoomRow {
    pub id: i64,
    pub name: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: i64,
    pub room_id: i64,
    pub owner_id: i64,
    pub content: String,
    pub mood: String,
    pub experience_points: i64,
    pub is_harmful: bool,
    pub created_at: String,
}

/// New gamification state for one user.
pub struct UserStatusRow {
    pub id: i64,
    pub experience_points: i64,
    pub mood: String,
    pub harmful_count: i64,
}

pub struct NewMessageRow {
    pub room_id: i64,
    pub owner_id: i64,
    pub content: String,
    pub mood: String,
    pub experience_points: i64,
    pub is_harmful: bool,
}
