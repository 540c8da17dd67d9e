use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (users, devices, deferred messages)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                username    TEXT NOT NULL,
                hidden      INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE devices (
                id              TEXT PRIMARY KEY,
                user_id         TEXT NOT NULL UNIQUE REFERENCES users(id) ON DELETE CASCADE,
                registration_id TEXT NOT NULL UNIQUE,
                is_active       INTEGER NOT NULL DEFAULT 1,
                created_at      TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE deferred_messages (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                title       TEXT NOT NULL,
                body        TEXT NOT NULL,
                data        TEXT NOT NULL DEFAULT '{}',
                tag_kind    TEXT,
                tag_id      TEXT,
                attempts    INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL DEFAULT (datetime('now')),
                last_try    TEXT
            );

            CREATE INDEX idx_deferred_user ON deferred_messages(user_id, id);
            CREATE INDEX idx_deferred_tag ON deferred_messages(tag_kind, tag_id);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    if version < 2 {
        info!("Running migration v2 (meetings, participants, friendships)");
        conn.execute_batch(
            "
            CREATE TABLE meetings (
                id           TEXT PRIMARY KEY,
                organiser_id TEXT NOT NULL REFERENCES users(id),
                kind         TEXT NOT NULL,
                status       TEXT NOT NULL DEFAULT 'pending',
                created_at   TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE participants (
                id          TEXT PRIMARY KEY,
                meeting_id  TEXT NOT NULL REFERENCES meetings(id) ON DELETE CASCADE,
                user_id     TEXT NOT NULL REFERENCES users(id),
                accepted    INTEGER,
                arrived     INTEGER NOT NULL DEFAULT 0,
                UNIQUE(meeting_id, user_id)
            );

            CREATE INDEX idx_participants_user ON participants(user_id);

            CREATE TABLE friendships (
                id            TEXT PRIMARY KEY,
                from_id       TEXT NOT NULL REFERENCES users(id),
                to_id         TEXT NOT NULL REFERENCES users(id),
                pair_key      TEXT NOT NULL UNIQUE,
                is_accepted   INTEGER NOT NULL DEFAULT 0,
                is_hidden     INTEGER NOT NULL DEFAULT 0,
                from_blocking INTEGER NOT NULL DEFAULT 0,
                to_blocking   INTEGER NOT NULL DEFAULT 0,
                created_at    TEXT NOT NULL DEFAULT (datetime('now'))
            );

            INSERT INTO schema_version (version) VALUES (2);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
