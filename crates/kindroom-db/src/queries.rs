use crate::models::{MessageRow, NewMessageRow, RoomRow, UserRow, UserStatusRow};
use crate::Database;
use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;

impl Database {
    // -- Users --

    /// Registration lives outside this service; this exists for seeding and tests.
    pub fn create_user(&self, username: &str) -> Result<UserRow> {
        self.with_conn(|conn| {
            conn.execute("INSERT INTO users (username) VALUES (?1)", [username])?;
            let id = conn.last_insert_rowid();
            query_user(conn, id)?.ok_or_else(|| anyhow::anyhow!("User {} vanished after insert", id))
        })
    }

    pub fn get_user(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, id))
    }

    /// Returns `None` when no user has this id.
    pub fn update_user_status(&self, status: &UserStatusRow) -> Result<Option<UserRow>> {
        self.with_conn(|conn| write_user_status(conn, status))
    }

    // -- Rooms --

    pub fn create_room(&self, name: &str) -> Result<RoomRow> {
        self.with_conn(|conn| {
            conn.execute("INSERT INTO rooms (name) VALUES (?1)", [name])?;
            let id = conn.last_insert_rowid();
            query_room(conn, id)?.ok_or_else(|| anyhow::anyhow!("Room {} vanished after insert", id))
        })
    }

    pub fn get_room(&self, id: i64) -> Result<Option<RoomRow>> {
        self.with_conn(|conn| query_room(conn, id))
    }

    // -- Messages --

    pub fn insert_message(&self, message: &NewMessageRow) -> Result<MessageRow> {
        self.with_tx(|tx| write_message(tx, message))
    }

    /// Update the owner's status and insert the message as one unit of work.
    /// Returns `None` (and writes nothing) when the owner does not exist.
    pub fn record_message(
        &self,
        status: &UserStatusRow,
        message: &NewMessageRow,
    ) -> Result<Option<(UserRow, MessageRow)>> {
        self.with_tx(|tx| {
            let Some(user) = write_user_status(tx, status)? else {
                return Ok(None);
            };
            let message = write_message(tx, message)?;
            Ok(Some((user, message)))
        })
    }

    /// Most recent `limit` messages of a room, oldest first.
    pub fn recent_messages(&self, room_id: i64, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut rows = query_recent_messages(conn, room_id, limit)?;
            rows.reverse();
            Ok(rows)
        })
    }
}

fn query_user(conn: &Connection, id: i64) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, username, experience_points, mood, harmful_count, created_at
         FROM users WHERE id = ?1",
    )?;

    let row = stmt
        .query_row([id], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                experience_points: row.get(2)?,
                mood: row.get(3)?,
                harmful_count: row.get(4)?,
                created_at: row.get(5)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_room(conn: &Connection, id: i64) -> Result<Option<RoomRow>> {
    let row = conn
        .query_row(
            "SELECT id, name, created_at FROM rooms WHERE id = ?1",
            [id],
            |row| {
                Ok(RoomRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    created_at: row.get(2)?,
                })
            },
        )
        .optional()?;

    Ok(row)
}

fn write_user_status(conn: &Connection, status: &UserStatusRow) -> Result<Option<UserRow>> {
    let changed = conn.execute(
        "UPDATE users SET experience_points = ?2, mood = ?3, harmful_count = ?4 WHERE id = ?1",
        rusqlite::params![status.id, status.experience_points, status.mood, status.harmful_count],
    )?;

    if changed == 0 {
        return Ok(None);
    }
    query_user(conn, status.id)
}

fn write_message(conn: &Connection, message: &NewMessageRow) -> Result<MessageRow> {
    let created_at = next_created_at(conn, message.room_id)?;

    conn.execute(
        "INSERT INTO messages (room_id, owner_id, content, mood, experience_points, is_harmful, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            message.room_id,
            message.owner_id,
            message.content,
            message.mood,
            message.experience_points,
            message.is_harmful,
            created_at,
        ],
    )?;

    Ok(MessageRow {
        id: conn.last_insert_rowid(),
        room_id: message.room_id,
        owner_id: message.owner_id,
        content: message.content.clone(),
        mood: message.mood.clone(),
        experience_points: message.experience_points,
        is_harmful: message.is_harmful,
        created_at,
    })
}

/// Creation timestamps never go backwards within a room, even if the wall
/// clock does. Fixed-width RFC 3339 in UTC, so text order is time order.
fn next_created_at(conn: &Connection, room_id: i64) -> Result<String> {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    let last: Option<String> = conn.query_row(
        "SELECT MAX(created_at) FROM messages WHERE room_id = ?1",
        [room_id],
        |row| row.get(0),
    )?;

    Ok(match last {
        Some(last) if last > now => last,
        _ => now,
    })
}

fn query_recent_messages(conn: &Connection, room_id: i64, limit: u32) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, room_id, owner_id, content, mood, experience_points, is_harmful, created_at
         FROM messages
         WHERE room_id = ?1
         ORDER BY created_at DESC, id DESC
         LIMIT ?2",
    )?;

    let rows = stmt
        .query_map(rusqlite::params![room_id, limit], |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                room_id: row.get(1)?,
                owner_id: row.get(2)?,
                content: row.get(3)?,
                mood: row.get(4)?,
                experience_points: row.get(5)?,
                is_harmful: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
