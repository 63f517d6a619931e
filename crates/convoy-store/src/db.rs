use rusqlite::{Connection, Result};

/// Initialise all pipeline tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    create_conversations_table(conn)?;
    create_messages_table(conn)?;
    create_request_tasks_table(conn)?;
    create_failed_messages_table(conn)?;
    create_delivery_settings_table(conn)?;
    Ok(())
}

fn create_conversations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            id             TEXT PRIMARY KEY,
            status         TEXT NOT NULL DEFAULT 'active',
            last_active_at TEXT NOT NULL,
            created_at     TEXT NOT NULL
        );",
    )
}

fn create_messages_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL,
            role            TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'pending',
            content         TEXT NOT NULL,
            retry_count     INTEGER NOT NULL DEFAULT 0,
            request_task_id TEXT,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, id);
        CREATE INDEX IF NOT EXISTS idx_messages_task
            ON messages(request_task_id);",
    )
}

/// One row per sealed batch. `content` is written once at creation and
/// never updated afterwards; only status/response/error/timestamps move.
fn create_request_tasks_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS request_tasks (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'pending',
            content         TEXT NOT NULL,
            message_count   INTEGER NOT NULL,
            response        TEXT,
            error           TEXT,
            started_at      TEXT,
            completed_at    TEXT,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_status
            ON request_tasks(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_tasks_conversation
            ON request_tasks(conversation_id, created_at);",
    )
}

/// Durable record of one failed dispatch attempt.
/// `retry_history` is a JSON array of {at, outcome} entries, append-only.
fn create_failed_messages_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS failed_messages (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL,
            request_task_id TEXT,
            message_id      INTEGER,
            error           TEXT NOT NULL,
            attempt_count   INTEGER NOT NULL DEFAULT 1,
            failed_at       TEXT NOT NULL,
            retried         INTEGER NOT NULL DEFAULT 0,
            retry_history   TEXT NOT NULL DEFAULT '[]'
        );
        CREATE INDEX IF NOT EXISTS idx_failed_task
            ON failed_messages(request_task_id);
        CREATE INDEX IF NOT EXISTS idx_failed_retried
            ON failed_messages(retried, failed_at);",
    )
}

/// At most one row has active=1; activation flips the rest off in the
/// same transaction (see ConversationStore::activate_settings).
fn create_delivery_settings_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS delivery_settings (
            id                     INTEGER PRIMARY KEY AUTOINCREMENT,
            batch_size_threshold   INTEGER NOT NULL,
            batch_time_window_secs INTEGER NOT NULL,
            request_timeout_secs   INTEGER NOT NULL,
            max_retries            INTEGER NOT NULL,
            active                 INTEGER NOT NULL DEFAULT 0,
            created_at             TEXT NOT NULL
        );",
    )
}
