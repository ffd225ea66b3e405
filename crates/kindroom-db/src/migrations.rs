use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub const GENERAL_ROOM_ID: i64 = 1;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            username            TEXT NOT NULL UNIQUE,
            experience_points   INTEGER NOT NULL DEFAULT 0 CHECK (experience_points >= 0),
            mood                TEXT NOT NULL DEFAULT 'smiling',
            harmful_count       INTEGER NOT NULL DEFAULT 0,
            created_at          TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS rooms (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS messages (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            room_id             INTEGER NOT NULL REFERENCES rooms(id),
            owner_id            INTEGER NOT NULL REFERENCES users(id),
            content             TEXT NOT NULL,
            mood                TEXT NOT NULL,
            experience_points   INTEGER NOT NULL,
            is_harmful          INTEGER NOT NULL,
            created_at          TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_room
            ON messages(room_id, created_at);

        -- Seed the default general room
        INSERT OR IGNORE INTO rooms (id, name)
            VALUES (1, 'general');
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
