use rusqlite::Connection;

use crate::error::Result;

/// Open (creating if needed) the SQLite database at `path` and apply schema
/// migrations. `path` may be `:memory:` for tests.
pub fn open(path: &str) -> Result<Connection> {
    if path != ":memory:" {
        if let Some(parent) = std::path::Path::new(path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY,
            slug            TEXT,
            parent_id       TEXT,
            cwd             TEXT,
            model           TEXT,
            user_initiated  INTEGER NOT NULL,
            next_sequence   INTEGER NOT NULL DEFAULT 1,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id                      TEXT PRIMARY KEY,
            conversation_id         TEXT NOT NULL REFERENCES conversations(id),
            sequence_id             INTEGER NOT NULL,
            message_type            TEXT NOT NULL,
            role                    TEXT NOT NULL,
            content_json            TEXT NOT NULL,
            display_payload_json    TEXT,
            usage_json              TEXT,
            error_kind              TEXT,
            end_of_turn             INTEGER NOT NULL DEFAULT 0,
            excluded_from_context   INTEGER NOT NULL DEFAULT 0,
            user_data_json          TEXT,
            created_at              TEXT NOT NULL,
            UNIQUE(conversation_id, sequence_id)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, sequence_id);
        "#,
    )?;
    Ok(())
}
