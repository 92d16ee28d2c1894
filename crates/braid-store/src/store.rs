use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use serde_json::Value;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use braid_core::types::{RequestRecord, RequestStatus};
use braid_link::{LinkError, LinkExecutors, ParentCriteria, ParentRequest, TaskInvocation};

use crate::db::init_db;
use crate::error::{Result, StoreError};

/// Thread-safe request log over a single SQLite connection.
///
/// A `Mutex<Connection>` is sufficient for the single-node target; queries
/// are short and index-backed. Rows are appended, never mutated in place.
pub struct RequestStore {
    db: Mutex<Connection>,
    slow_query_threshold_ms: u64,
    sql_debug: bool,
}

impl RequestStore {
    pub fn open(path: &str, slow_query_threshold_ms: u64, sql_debug: bool) -> Result<Self> {
        let conn = Connection::open(path)?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            slow_query_threshold_ms,
            sql_debug,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            slow_query_threshold_ms: 500,
            sql_debug: false,
        })
    }

    fn timed<T>(&self, label: &str, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if self.sql_debug {
            debug!(query = label, "executing");
        }
        let started = Instant::now();
        let db = self.db.lock().unwrap();
        let result = f(&db);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if elapsed_ms > self.slow_query_threshold_ms {
            warn!(query = label, elapsed_ms, "slow query");
        }
        result
    }

    /// Persist one completed (or partial) request. Also indexes the `Task`
    /// tool invocations found in the response so later single-message
    /// requests can be linked back as sub-tasks.
    pub fn insert_request(&self, record: &RequestRecord) -> Result<()> {
        let response_body = record
            .response_body
            .as_ref()
            .map(|b| serde_json::to_string(b).unwrap_or_default());
        let first_text = record
            .response_body
            .as_ref()
            .and_then(response_first_text)
            .map(|t| t.to_lowercase());
        let invocations = record
            .response_body
            .as_ref()
            .map(task_invocations_of)
            .unwrap_or_default();

        self.timed("insert_request", |db| {
            db.execute(
                "INSERT INTO requests
                 (request_id, domain, timestamp, model, request_type,
                  current_message_hash, parent_message_hash, system_hash,
                  conversation_id, branch_id, parent_request_id,
                  parent_task_request_id, is_subtask,
                  response_status, response_body, response_first_text,
                  input_tokens, output_tokens, cache_creation_tokens,
                  cache_read_tokens, tool_call_count, status,
                  processing_time_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                         ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
                rusqlite::params![
                    record.request_id,
                    record.domain,
                    ts_str(&record.timestamp),
                    record.model,
                    record.request_type.to_string(),
                    record.current_message_hash,
                    record.parent_message_hash,
                    record.system_hash,
                    record.conversation_id.map(|c| c.to_string()),
                    record.branch_id,
                    record.parent_request_id,
                    record.parent_task_request_id,
                    record.is_subtask,
                    record.response_status,
                    response_body,
                    first_text,
                    record.usage.input_tokens as i64,
                    record.usage.output_tokens as i64,
                    record.usage.cache_creation_input_tokens as i64,
                    record.usage.cache_read_input_tokens as i64,
                    record.tool_call_count,
                    record.status.to_string(),
                    record.processing_time_ms as i64,
                ],
            )?;

            for (tool_use_id, prompt) in &invocations {
                db.execute(
                    "INSERT OR IGNORE INTO task_invocations
                     (request_id, domain, tool_use_id, prompt, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        record.request_id,
                        record.domain,
                        tool_use_id,
                        prompt,
                        ts_str(&record.timestamp),
                    ],
                )?;
            }
            Ok(())
        })
    }

    /// Queue a conversation for background analysis.
    pub fn enqueue_analysis(&self, conversation_id: Uuid, branch_id: &str) -> Result<()> {
        self.timed("enqueue_analysis", |db| {
            db.execute(
                "INSERT INTO analysis_jobs (conversation_id, branch_id, status, created_at)
                 VALUES (?1, ?2, 'pending', ?3)",
                rusqlite::params![
                    conversation_id.to_string(),
                    branch_id,
                    ts_str(&Utc::now())
                ],
            )?;
            Ok(())
        })
    }

    pub fn pending_analysis_count(&self) -> Result<u64> {
        self.timed("pending_analysis_count", |db| {
            let count: i64 = db.query_row(
                "SELECT COUNT(*) FROM analysis_jobs WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    pub fn request_count(&self) -> Result<u64> {
        self.timed("request_count", |db| {
            let count: i64 =
                db.query_row("SELECT COUNT(*) FROM requests", [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    fn query_parents(&self, criteria: &ParentCriteria) -> Result<Vec<ParentRequest>> {
        let mut sql = String::from(
            "SELECT request_id, conversation_id, branch_id, current_message_hash, system_hash
             FROM requests WHERE conversation_id IS NOT NULL",
        );
        let mut params: Vec<String> = Vec::new();

        if !criteria.domain.is_empty() {
            params.push(criteria.domain.clone());
            sql.push_str(&format!(" AND domain = ?{}", params.len()));
        }
        if let Some(hash) = &criteria.current_message_hash {
            params.push(hash.clone());
            sql.push_str(&format!(" AND current_message_hash = ?{}", params.len()));
        }
        if let Some(hash) = &criteria.parent_message_hash {
            params.push(hash.clone());
            sql.push_str(&format!(" AND parent_message_hash = ?{}", params.len()));
        }
        if let Some(hash) = &criteria.system_hash {
            params.push(hash.clone());
            sql.push_str(&format!(" AND system_hash = ?{}", params.len()));
        }
        if let Some(id) = &criteria.exclude_request_id {
            params.push(id.clone());
            sql.push_str(&format!(" AND request_id != ?{}", params.len()));
        }
        if let Some(before) = &criteria.before_timestamp {
            params.push(ts_str(before));
            sql.push_str(&format!(" AND timestamp < ?{}", params.len()));
        }
        if let Some(conversation_id) = &criteria.conversation_id {
            params.push(conversation_id.to_string());
            sql.push_str(&format!(" AND conversation_id = ?{}", params.len()));
        }
        sql.push_str(" ORDER BY timestamp DESC, request_id DESC LIMIT 10");

        self.timed("query_parents", |db| {
            let mut stmt = db.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), row_to_parent)?;
            Ok(rows.filter_map(|r| r.ok()).flatten().collect())
        })
    }

    fn query_compact_parent(
        &self,
        domain: &str,
        normalized_summary: &str,
        after: &DateTime<Utc>,
        before: &DateTime<Utc>,
    ) -> Result<Option<ParentRequest>> {
        self.timed("query_compact_parent", |db| {
            let mut stmt = db.prepare(
                "SELECT request_id, conversation_id, branch_id, current_message_hash,
                        system_hash, response_first_text
                 FROM requests
                 WHERE domain = ?1 AND timestamp >= ?2 AND timestamp <= ?3
                   AND conversation_id IS NOT NULL
                   AND response_first_text IS NOT NULL
                 ORDER BY timestamp DESC, request_id DESC
                 LIMIT 100",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![domain, ts_str(after), ts_str(before)],
                |row| {
                    let first_text: Option<String> = row.get(5)?;
                    Ok((row_to_parent(row)?, first_text))
                },
            )?;
            // Prefix matching happens here rather than with LIKE so summary
            // metacharacters cannot distort the match.
            for row in rows.filter_map(|r| r.ok()) {
                let (parent, first_text) = row;
                if let (Some(parent), Some(text)) = (parent, first_text) {
                    if text.starts_with(normalized_summary) {
                        return Ok(Some(parent));
                    }
                }
            }
            Ok(None)
        })
    }

    fn query_by_id(&self, request_id: &str) -> Result<Option<ParentRequest>> {
        self.timed("query_by_id", |db| {
            let mut stmt = db.prepare(
                "SELECT request_id, conversation_id, branch_id, current_message_hash, system_hash
                 FROM requests WHERE request_id = ?1 AND conversation_id IS NOT NULL",
            )?;
            let mut rows = stmt.query_map(rusqlite::params![request_id], row_to_parent)?;
            match rows.next() {
                Some(row) => Ok(row?),
                None => Ok(None),
            }
        })
    }

    fn query_task_invocations(
        &self,
        domain: &str,
        before: &DateTime<Utc>,
        prompt: Option<&str>,
    ) -> Result<Vec<TaskInvocation>> {
        self.timed("query_task_invocations", |db| {
            let mut sql = String::from(
                "SELECT request_id, tool_use_id, prompt, timestamp FROM task_invocations
                 WHERE domain = ?1 AND timestamp < ?2",
            );
            let mut params: Vec<String> = vec![domain.to_string(), ts_str(before)];
            if let Some(prompt) = prompt {
                params.push(prompt.to_string());
                sql.push_str(" AND prompt = ?3");
            }
            sql.push_str(" ORDER BY timestamp DESC LIMIT 20");

            let mut stmt = db.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
                let ts: String = row.get(3)?;
                Ok(TaskInvocation {
                    request_id: row.get(0)?,
                    tool_use_id: row.get(1)?,
                    prompt: row.get(2)?,
                    timestamp: parse_ts(&ts).unwrap_or_else(Utc::now),
                })
            })?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    fn query_max_subtask_sequence(
        &self,
        conversation_id: Uuid,
        before: &DateTime<Utc>,
    ) -> Result<u32> {
        self.timed("query_max_subtask_sequence", |db| {
            let mut stmt = db.prepare(
                "SELECT branch_id FROM requests
                 WHERE conversation_id = ?1 AND branch_id LIKE 'subtask\\_%' ESCAPE '\\'
                   AND timestamp < ?2",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![conversation_id.to_string(), ts_str(before)],
                |row| row.get::<_, String>(0),
            )?;
            Ok(rows
                .filter_map(|r| r.ok())
                .filter_map(|b| b.strip_prefix("subtask_").and_then(|n| n.parse().ok()))
                .max()
                .unwrap_or(0))
        })
    }
}

#[async_trait]
impl LinkExecutors for RequestStore {
    async fn find_parents(
        &self,
        criteria: &ParentCriteria,
    ) -> std::result::Result<Vec<ParentRequest>, LinkError> {
        Ok(self.query_parents(criteria)?)
    }

    async fn find_compact_parent(
        &self,
        domain: &str,
        normalized_summary: &str,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> std::result::Result<Option<ParentRequest>, LinkError> {
        Ok(self.query_compact_parent(domain, normalized_summary, &after, &before)?)
    }

    async fn find_by_id(
        &self,
        request_id: &str,
    ) -> std::result::Result<Option<ParentRequest>, LinkError> {
        Ok(self.query_by_id(request_id)?)
    }

    async fn recent_task_invocations(
        &self,
        domain: &str,
        before: DateTime<Utc>,
        prompt: Option<&str>,
    ) -> std::result::Result<Vec<TaskInvocation>, LinkError> {
        Ok(self.query_task_invocations(domain, &before, prompt)?)
    }

    async fn max_subtask_sequence(
        &self,
        conversation_id: Uuid,
        before: DateTime<Utc>,
    ) -> std::result::Result<u32, LinkError> {
        Ok(self.query_max_subtask_sequence(conversation_id, &before)?)
    }
}

fn ts_str(t: &DateTime<Utc>) -> String {
    // Fixed-width UTC form so string comparison matches time ordering.
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Rows with an unparseable conversation id are skipped, not fatal.
fn row_to_parent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<ParentRequest>> {
    let conversation: String = row.get(1)?;
    let Ok(conversation_id) = Uuid::parse_str(&conversation) else {
        return Ok(None);
    };
    Ok(Some(ParentRequest {
        request_id: row.get(0)?,
        conversation_id,
        branch_id: row.get(2)?,
        current_message_hash: row.get(3)?,
        system_hash: row.get(4)?,
    }))
}

/// Lowercasable first text block of a response body.
fn response_first_text(body: &Value) -> Option<String> {
    body.get("content")?
        .as_array()?
        .iter()
        .find(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .and_then(|b| b.get("text").and_then(Value::as_str))
        .map(String::from)
}

/// `(tool_use_id, prompt)` of every `Task` tool call in a response body.
fn task_invocations_of(body: &Value) -> Vec<(String, String)> {
    let Some(content) = body.get("content").and_then(Value::as_array) else {
        return Vec::new();
    };
    content
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_use"))
        .filter(|b| b.get("name").and_then(Value::as_str) == Some("Task"))
        .filter_map(|b| {
            let id = b.get("id").and_then(Value::as_str)?;
            let prompt = b
                .pointer("/input/prompt")
                .or_else(|| b.pointer("/input/description"))
                .and_then(Value::as_str)?;
            Some((id.to_string(), prompt.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::types::{RequestType, TokenUsage};
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_754_000_000 + secs, 0).unwrap()
    }

    fn record(
        request_id: &str,
        domain: &str,
        conversation_id: Option<Uuid>,
        branch_id: &str,
        current_hash: &str,
        timestamp: DateTime<Utc>,
    ) -> RequestRecord {
        RequestRecord {
            request_id: request_id.to_string(),
            domain: domain.to_string(),
            timestamp,
            model: "claude-sonnet-4-5".to_string(),
            request_type: RequestType::Inference,
            current_message_hash: current_hash.to_string(),
            parent_message_hash: None,
            system_hash: None,
            conversation_id,
            branch_id: branch_id.to_string(),
            parent_request_id: None,
            parent_task_request_id: None,
            is_subtask: false,
            response_status: 200,
            response_body: None,
            usage: TokenUsage::default(),
            tool_call_count: 0,
            status: RequestStatus::Completed,
            processing_time_ms: 100,
        }
    }

    #[test]
    fn parents_are_ordered_newest_first() {
        let store = RequestStore::open_in_memory().unwrap();
        let conversation = Uuid::new_v4();
        for (id, secs) in [("req-a", 0), ("req-c", 120), ("req-b", 60)] {
            store
                .insert_request(&record(id, "acme", Some(conversation), "main", "h1", ts(secs)))
                .unwrap();
        }

        let parents = store
            .query_parents(&ParentCriteria {
                domain: "acme".to_string(),
                current_message_hash: Some("h1".to_string()),
                ..Default::default()
            })
            .unwrap();
        let ids: Vec<&str> = parents.iter().map(|p| p.request_id.as_str()).collect();
        assert_eq!(ids, vec!["req-c", "req-b", "req-a"]);
    }

    #[test]
    fn before_timestamp_and_exclude_filters_apply() {
        let store = RequestStore::open_in_memory().unwrap();
        let conversation = Uuid::new_v4();
        store
            .insert_request(&record("req-a", "acme", Some(conversation), "main", "h1", ts(0)))
            .unwrap();
        store
            .insert_request(&record("req-b", "acme", Some(conversation), "main", "h1", ts(100)))
            .unwrap();

        let parents = store
            .query_parents(&ParentCriteria {
                domain: "acme".to_string(),
                current_message_hash: Some("h1".to_string()),
                before_timestamp: Some(ts(50)),
                exclude_request_id: Some("req-b".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(parents.len(), 1);
        assert_eq!(parents[0].request_id, "req-a");
    }

    #[test]
    fn compact_search_prefix_matches_lowercased_first_text() {
        let store = RequestStore::open_in_memory().unwrap();
        let conversation = Uuid::new_v4();
        let mut row = record("req-a", "acme", Some(conversation), "main", "h1", ts(0));
        row.response_body = Some(json!({
            "content": [
                {"type": "text", "text": "We Refactored The Retry Engine and more"},
            ]
        }));
        store.insert_request(&row).unwrap();

        let found = store
            .query_compact_parent("acme", "we refactored the retry engine", &ts(-10), &ts(10))
            .unwrap();
        assert_eq!(found.unwrap().request_id, "req-a");

        // Not a prefix — no match.
        let missing = store
            .query_compact_parent("acme", "the retry engine", &ts(-10), &ts(10))
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn task_invocations_are_indexed_from_response() {
        let store = RequestStore::open_in_memory().unwrap();
        let conversation = Uuid::new_v4();
        let mut row = record("req-a", "acme", Some(conversation), "main", "h1", ts(0));
        row.response_body = Some(json!({
            "content": [
                {"type": "text", "text": "Launching tasks"},
                {"type": "tool_use", "id": "tu-1", "name": "Task",
                 "input": {"prompt": "do X"}},
                {"type": "tool_use", "id": "tu-2", "name": "Bash",
                 "input": {"cmd": "ls"}},
            ]
        }));
        store.insert_request(&row).unwrap();

        let invocations = store
            .query_task_invocations("acme", &ts(10), Some("do X"))
            .unwrap();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].tool_use_id, "tu-1");
        assert_eq!(invocations[0].request_id, "req-a");

        // The Bash tool_use is not indexed.
        let all = store.query_task_invocations("acme", &ts(10), None).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn max_subtask_sequence_parses_branch_names() {
        let store = RequestStore::open_in_memory().unwrap();
        let conversation = Uuid::new_v4();
        for (id, branch, secs) in
            [("r1", "main", 0), ("r2", "subtask_2", 10), ("r3", "subtask_7", 20)]
        {
            store
                .insert_request(&record(id, "acme", Some(conversation), branch, "h", ts(secs)))
                .unwrap();
        }
        let max = store
            .query_max_subtask_sequence(conversation, &ts(100))
            .unwrap();
        assert_eq!(max, 7);

        // Only rows before the cutoff count.
        let earlier = store
            .query_max_subtask_sequence(conversation, &ts(15))
            .unwrap();
        assert_eq!(earlier, 2);
    }

    #[test]
    fn analysis_jobs_enqueue() {
        let store = RequestStore::open_in_memory().unwrap();
        let conversation = Uuid::new_v4();
        store.enqueue_analysis(conversation, "main").unwrap();
        assert_eq!(store.pending_analysis_count().unwrap(), 1);
    }

    #[test]
    fn rows_without_conversation_are_not_parents() {
        let store = RequestStore::open_in_memory().unwrap();
        store
            .insert_request(&record("req-a", "acme", None, "main", "h1", ts(0)))
            .unwrap();
        let parents = store
            .query_parents(&ParentCriteria {
                domain: "acme".to_string(),
                current_message_hash: Some("h1".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(parents.is_empty());
    }
}
