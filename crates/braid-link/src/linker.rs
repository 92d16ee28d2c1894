use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use braid_core::types::{first_text, system_text};
use braid_hash::{compute_hashes, hash_system, strip_reminders, MessageHashes};

use crate::error::{LinkError, Result};
use crate::executor::{LinkExecutors, ParentCriteria, ParentRequest};

const CONTINUATION_MARKER: &str =
    "This session is being continued from a previous conversation that ran out of context";
const SUMMARY_MARKER: &str = "The conversation is summarized below:";
const CONTINUE_MARKER: &str = "Please continue the conversation";
const SUMMARIZATION_SYSTEM_MARKER: &str =
    "You are a helpful AI assistant tasked with summarizing conversations";
const COMPACT_WINDOW_DAYS: i64 = 7;

/// Everything the linker needs to know about one inbound request.
#[derive(Debug, Clone)]
pub struct LinkInput<'a> {
    pub domain: &'a str,
    pub messages: &'a [Value],
    pub system: Option<&'a Value>,
    pub request_id: &'a str,
    pub timestamp: DateTime<Utc>,
}

/// The linker's verdict: where this request sits in the conversation graph.
/// `conversation_id` is `None` for a brand-new conversation — the caller
/// allocates the id.
#[derive(Debug, Clone)]
pub struct Linkage {
    pub conversation_id: Option<Uuid>,
    pub parent_request_id: Option<String>,
    pub branch_id: String,
    pub current_message_hash: String,
    pub parent_message_hash: Option<String>,
    pub system_hash: Option<String>,
    pub is_subtask: bool,
    pub parent_task_request_id: Option<String>,
    pub subtask_sequence: Option<u32>,
}

/// Stateless resolver over the injected executor seam. Instantiated per
/// request; holds no caches of its own.
pub struct ConversationLinker {
    store: Arc<dyn LinkExecutors>,
}

impl ConversationLinker {
    pub fn new(store: Arc<dyn LinkExecutors>) -> Self {
        Self { store }
    }

    /// Resolve the parent, branch, and hashes for one request.
    ///
    /// Executor failures never surface: the request falls back to a new
    /// conversation. The only hard error is an empty message list.
    pub async fn link(&self, input: &LinkInput<'_>) -> Result<Linkage> {
        if input.messages.is_empty() {
            return Err(LinkError::EmptyMessages);
        }

        let hashes = compute_hashes(input.messages);
        let system_hash = input.system.map(hash_system);

        match self.resolve(input, &hashes, &system_hash).await {
            Ok(linkage) => Ok(linkage),
            Err(e) => {
                warn!(
                    domain = input.domain,
                    request_id = input.request_id,
                    error = %e,
                    "conversation lookup failed; starting new conversation"
                );
                Ok(new_conversation(&hashes, &system_hash))
            }
        }
    }

    async fn resolve(
        &self,
        input: &LinkInput<'_>,
        hashes: &MessageHashes,
        system_hash: &Option<String>,
    ) -> Result<Linkage> {
        if is_single_user_message(input.messages) {
            if let Some(linkage) = self.try_subtask(input, hashes, system_hash).await? {
                return Ok(linkage);
            }
            if let Some(linkage) = self.try_compact(input, hashes, system_hash).await? {
                return Ok(linkage);
            }
            return Ok(new_conversation(hashes, system_hash));
        }

        if hashes.parent.is_none() {
            // Too few messages after dedup to have a prior turn.
            return Ok(new_conversation(hashes, system_hash));
        }

        self.resolve_parent(input, hashes, system_hash).await
    }

    /// Sub-task check: a single-message request whose text matches a recent
    /// `Task` tool invocation inherits the invoking conversation.
    async fn try_subtask(
        &self,
        input: &LinkInput<'_>,
        hashes: &MessageHashes,
        system_hash: &Option<String>,
    ) -> Result<Option<Linkage>> {
        let Some(text) = first_text(&input.messages[0]) else {
            return Ok(None);
        };
        let prompt = strip_reminders(&text).trim().to_string();
        if prompt.is_empty() {
            return Ok(None);
        }

        let invocations = self
            .store
            .recent_task_invocations(input.domain, input.timestamp, Some(&prompt))
            .await?;
        let Some(invocation) = invocations.first().cloned() else {
            return Ok(None);
        };

        let Some(parent) = self.store.find_by_id(&invocation.request_id).await? else {
            return Ok(None);
        };

        let base = self
            .store
            .max_subtask_sequence(parent.conversation_id, input.timestamp)
            .await?;

        // Identical prompts launched by the same parent are numbered by
        // invocation time.
        let mut siblings: Vec<_> = invocations
            .iter()
            .filter(|i| i.request_id == invocation.request_id)
            .collect();
        siblings.sort_by_key(|i| i.timestamp);
        let k = siblings
            .iter()
            .position(|i| i.tool_use_id == invocation.tool_use_id)
            .map(|p| p as u32 + 1)
            .unwrap_or(1);

        let sequence = base + k;
        debug!(
            domain = input.domain,
            conversation_id = %parent.conversation_id,
            sequence,
            "linked sub-task invocation"
        );

        Ok(Some(Linkage {
            conversation_id: Some(parent.conversation_id),
            parent_request_id: None,
            branch_id: format!("subtask_{sequence}"),
            current_message_hash: hashes.current.clone(),
            parent_message_hash: None,
            system_hash: system_hash.clone(),
            is_subtask: true,
            parent_task_request_id: Some(invocation.request_id),
            subtask_sequence: Some(sequence),
        }))
    }

    /// Compact-continuation check: a summary of a prior session continues
    /// that session on a dedicated `compact_` branch.
    async fn try_compact(
        &self,
        input: &LinkInput<'_>,
        hashes: &MessageHashes,
        system_hash: &Option<String>,
    ) -> Result<Option<Linkage>> {
        let Some(text) = first_text(&input.messages[0]) else {
            return Ok(None);
        };
        let Some(summary) = extract_summary(&text) else {
            return Ok(None);
        };

        let after = input.timestamp - Duration::days(COMPACT_WINDOW_DAYS);
        let Some(parent) = self
            .store
            .find_compact_parent(input.domain, &summary, after, input.timestamp)
            .await?
        else {
            return Ok(None);
        };

        debug!(
            domain = input.domain,
            conversation_id = %parent.conversation_id,
            parent_request_id = parent.request_id,
            "linked compact continuation"
        );

        Ok(Some(Linkage {
            conversation_id: Some(parent.conversation_id),
            parent_request_id: Some(parent.request_id.clone()),
            branch_id: format!("compact_{}", input.timestamp.format("%H%M%S")),
            current_message_hash: hashes.current.clone(),
            parent_message_hash: Some(parent.current_message_hash),
            system_hash: system_hash.clone(),
            is_subtask: false,
            parent_task_request_id: None,
            subtask_sequence: None,
        }))
    }

    /// Multi-message resolution: the priority ladder, then the branching rule.
    async fn resolve_parent(
        &self,
        input: &LinkInput<'_>,
        hashes: &MessageHashes,
        system_hash: &Option<String>,
    ) -> Result<Linkage> {
        let parent_hash = hashes.parent.clone().unwrap_or_default();

        let base = ParentCriteria {
            domain: input.domain.to_string(),
            exclude_request_id: Some(input.request_id.to_string()),
            before_timestamp: Some(input.timestamp),
            ..Default::default()
        };

        // Priority i — parent hash + system hash, only when a system prompt
        // is present.
        if let Some(sh) = system_hash {
            let candidates = self
                .store
                .find_parents(&ParentCriteria {
                    current_message_hash: Some(parent_hash.clone()),
                    system_hash: Some(sh.clone()),
                    ..base.clone()
                })
                .await?;
            if let Some(parent) = candidates.into_iter().next() {
                return self
                    .attach_to_parent(input, hashes, system_hash, parent)
                    .await;
            }
        }

        // Priority ii — parent hash unfiltered, summarization requests only.
        if is_summarization_request(input.system) {
            let candidates = self
                .store
                .find_parents(&ParentCriteria {
                    current_message_hash: Some(parent_hash.clone()),
                    ..base.clone()
                })
                .await?;
            if let Some(parent) = candidates.into_iter().next() {
                return self
                    .attach_to_parent(input, hashes, system_hash, parent)
                    .await;
            }
        }

        // Priority iii — parent hash, no system filter.
        let candidates = self
            .store
            .find_parents(&ParentCriteria {
                current_message_hash: Some(parent_hash.clone()),
                ..base.clone()
            })
            .await?;
        if let Some(parent) = candidates.into_iter().next() {
            return self
                .attach_to_parent(input, hashes, system_hash, parent)
                .await;
        }

        // Priority iv — grandparent fallback, compensating for a lost
        // intermediate request. Conversation and branch come from the
        // grandparent row; the computed hashes stay untouched.
        if hashes.dedup_len > 4 {
            if let Some(gh) = &hashes.grandparent {
                let candidates = self
                    .store
                    .find_parents(&ParentCriteria {
                        current_message_hash: Some(gh.clone()),
                        ..base
                    })
                    .await?;
                if let Some(grandparent) = candidates.into_iter().next() {
                    debug!(
                        domain = input.domain,
                        conversation_id = %grandparent.conversation_id,
                        "reattached via grandparent hash"
                    );
                    return Ok(Linkage {
                        conversation_id: Some(grandparent.conversation_id),
                        parent_request_id: Some(grandparent.request_id),
                        branch_id: grandparent.branch_id,
                        current_message_hash: hashes.current.clone(),
                        parent_message_hash: hashes.parent.clone(),
                        system_hash: system_hash.clone(),
                        is_subtask: false,
                        parent_task_request_id: None,
                        subtask_sequence: None,
                    });
                }
            }
        }

        Ok(new_conversation(hashes, system_hash))
    }

    async fn attach_to_parent(
        &self,
        input: &LinkInput<'_>,
        hashes: &MessageHashes,
        system_hash: &Option<String>,
        parent: ParentRequest,
    ) -> Result<Linkage> {
        let branch_id = self.resolve_branch(input, &parent).await?;
        Ok(Linkage {
            conversation_id: Some(parent.conversation_id),
            parent_request_id: Some(parent.request_id),
            branch_id,
            current_message_hash: hashes.current.clone(),
            parent_message_hash: hashes.parent.clone(),
            system_hash: system_hash.clone(),
            is_subtask: false,
            parent_task_request_id: None,
            subtask_sequence: None,
        })
    }

    /// Branching rule: descendants of a compact parent inherit its branch
    /// unconditionally; a second child of any other parent opens a new
    /// timestamped branch.
    async fn resolve_branch(
        &self,
        input: &LinkInput<'_>,
        parent: &ParentRequest,
    ) -> Result<String> {
        if parent.branch_id.starts_with("compact_") {
            return Ok(parent.branch_id.clone());
        }

        let siblings = self
            .store
            .find_parents(&ParentCriteria {
                domain: input.domain.to_string(),
                conversation_id: Some(parent.conversation_id),
                parent_message_hash: Some(parent.current_message_hash.clone()),
                exclude_request_id: Some(input.request_id.to_string()),
                ..Default::default()
            })
            .await?;

        if siblings.is_empty() {
            Ok(parent.branch_id.clone())
        } else {
            Ok(format!("branch_{}", input.timestamp.format("%Y%m%d%H%M%S")))
        }
    }
}

fn new_conversation(hashes: &MessageHashes, system_hash: &Option<String>) -> Linkage {
    Linkage {
        conversation_id: None,
        parent_request_id: None,
        branch_id: "main".to_string(),
        current_message_hash: hashes.current.clone(),
        parent_message_hash: hashes.parent.clone(),
        system_hash: system_hash.clone(),
        is_subtask: false,
        parent_task_request_id: None,
        subtask_sequence: None,
    }
}

fn is_single_user_message(messages: &[Value]) -> bool {
    messages.len() == 1
        && messages[0].get("role").and_then(Value::as_str) == Some("user")
}

fn is_summarization_request(system: Option<&Value>) -> bool {
    system.is_some_and(|s| system_text(s).contains(SUMMARIZATION_SYSTEM_MARKER))
}

/// Extract the normalized summary from a compact-continuation message:
/// the text between the summary marker and the optional continue marker,
/// trimmed, trailing dots stripped, lowercased.
fn extract_summary(text: &str) -> Option<String> {
    if !text.contains(CONTINUATION_MARKER) {
        return None;
    }
    let start = text.find(SUMMARY_MARKER)? + SUMMARY_MARKER.len();
    let rest = &text[start..];
    let summary = match rest.find(CONTINUE_MARKER) {
        Some(end) => &rest[..end],
        None => rest,
    };
    let normalized = summary.trim().trim_end_matches('.').trim().to_lowercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_summary_between_markers() {
        let text = format!(
            "{CONTINUATION_MARKER}. {SUMMARY_MARKER} We built a parser.\n{CONTINUE_MARKER} from here."
        );
        assert_eq!(extract_summary(&text).as_deref(), Some("we built a parser"));
    }

    #[test]
    fn summary_without_continue_marker_runs_to_end() {
        let text = format!("{CONTINUATION_MARKER}. {SUMMARY_MARKER} Fixed the build...");
        assert_eq!(extract_summary(&text).as_deref(), Some("fixed the build"));
    }

    #[test]
    fn no_markers_means_no_summary() {
        assert!(extract_summary("an ordinary first message").is_none());
        // Summary marker alone is not enough.
        assert!(extract_summary(&format!("{SUMMARY_MARKER} text")).is_none());
    }

    #[test]
    fn single_user_message_detection() {
        let user = vec![serde_json::json!({"role": "user", "content": "hi"})];
        assert!(is_single_user_message(&user));
        let assistant = vec![serde_json::json!({"role": "assistant", "content": "hi"})];
        assert!(!is_single_user_message(&assistant));
    }
}
