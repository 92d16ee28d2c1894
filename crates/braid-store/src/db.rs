use rusqlite::{Connection, Result};

/// Initialise proxy tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_requests_table(conn)?;
    create_task_invocations_table(conn)?;
    create_analysis_jobs_table(conn)?;
    Ok(())
}

fn create_requests_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS requests (
            request_id              TEXT PRIMARY KEY,
            domain                  TEXT NOT NULL,
            timestamp               TEXT NOT NULL,
            model                   TEXT NOT NULL,
            request_type            TEXT NOT NULL,
            current_message_hash    TEXT NOT NULL,
            parent_message_hash     TEXT,
            system_hash             TEXT,
            conversation_id         TEXT,
            branch_id               TEXT NOT NULL,
            parent_request_id       TEXT,
            parent_task_request_id  TEXT,
            is_subtask              INTEGER NOT NULL DEFAULT 0,
            response_status         INTEGER NOT NULL DEFAULT 0,
            response_body           TEXT,
            response_first_text     TEXT,
            input_tokens            INTEGER NOT NULL DEFAULT 0,
            output_tokens           INTEGER NOT NULL DEFAULT 0,
            cache_creation_tokens   INTEGER NOT NULL DEFAULT 0,
            cache_read_tokens       INTEGER NOT NULL DEFAULT 0,
            tool_call_count         INTEGER NOT NULL DEFAULT 0,
            status                  TEXT NOT NULL,
            processing_time_ms      INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_requests_parent_lookup
            ON requests(domain, current_message_hash, timestamp DESC);
        CREATE INDEX IF NOT EXISTS idx_requests_conversation
            ON requests(conversation_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_requests_domain_time
            ON requests(domain, timestamp DESC);",
    )
}

/// One row per `Task` tool invocation found in a persisted response —
/// the lookup table for sub-task linking.
fn create_task_invocations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS task_invocations (
            request_id  TEXT NOT NULL,
            domain      TEXT NOT NULL,
            tool_use_id TEXT NOT NULL,
            prompt      TEXT NOT NULL,
            timestamp   TEXT NOT NULL,
            PRIMARY KEY (request_id, tool_use_id)
        );
        CREATE INDEX IF NOT EXISTS idx_task_domain_time
            ON task_invocations(domain, timestamp DESC);",
    )
}

fn create_analysis_jobs_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS analysis_jobs (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL,
            branch_id       TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'pending',
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_analysis_pending
            ON analysis_jobs(status, created_at);",
    )
}
