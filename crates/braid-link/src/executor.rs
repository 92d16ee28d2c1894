//! The injected seam between the linker and the external store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;

/// Filter for parent-request lookups. Unset fields are not constrained.
#[derive(Debug, Clone, Default)]
pub struct ParentCriteria {
    pub domain: String,
    /// Match rows whose own current hash equals this value.
    pub current_message_hash: Option<String>,
    /// Match rows that recorded this value as their parent hash.
    pub parent_message_hash: Option<String>,
    pub system_hash: Option<String>,
    pub exclude_request_id: Option<String>,
    pub before_timestamp: Option<DateTime<Utc>>,
    pub conversation_id: Option<Uuid>,
}

/// A candidate parent row. Results are ordered by descending timestamp,
/// then descending request id.
#[derive(Debug, Clone)]
pub struct ParentRequest {
    pub request_id: String,
    pub conversation_id: Uuid,
    pub branch_id: String,
    pub current_message_hash: String,
    pub system_hash: Option<String>,
}

/// A recorded `Task` tool invocation — the launch point of a sub-task.
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    pub request_id: String,
    pub tool_use_id: String,
    pub prompt: String,
    pub timestamp: DateTime<Utc>,
}

/// Store access used by the linker. Implementations must preserve the
/// ordering contracts above; the linker always takes the first row of a
/// non-empty result.
#[async_trait]
pub trait LinkExecutors: Send + Sync {
    async fn find_parents(&self, criteria: &ParentCriteria) -> Result<Vec<ParentRequest>>;

    /// Prefix match of `normalized_summary` (lowercased) against the first
    /// text block of a stored response body, within `[after, before]`.
    async fn find_compact_parent(
        &self,
        domain: &str,
        normalized_summary: &str,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> Result<Option<ParentRequest>>;

    async fn find_by_id(&self, request_id: &str) -> Result<Option<ParentRequest>>;

    /// Recent `Task` invocations in the domain before `before`, optionally
    /// filtered to an exact prompt.
    async fn recent_task_invocations(
        &self,
        domain: &str,
        before: DateTime<Utc>,
        prompt: Option<&str>,
    ) -> Result<Vec<TaskInvocation>>;

    /// Max `N` across existing `subtask_N` branches of the conversation
    /// before `before`. Zero when none exist.
    async fn max_subtask_sequence(
        &self,
        conversation_id: Uuid,
        before: DateTime<Utc>,
    ) -> Result<u32>;
}
