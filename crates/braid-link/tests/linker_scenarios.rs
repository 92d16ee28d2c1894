//! End-to-end linker scenarios against an in-memory store fake.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use braid_hash::compute_hashes;
use braid_link::{
    ConversationLinker, LinkError, LinkExecutors, LinkInput, ParentCriteria, ParentRequest,
    TaskInvocation,
};

#[derive(Clone)]
struct Row {
    domain: String,
    timestamp: DateTime<Utc>,
    parent_message_hash: Option<String>,
    response_first_text: Option<String>,
    parent: ParentRequest,
}

#[derive(Default)]
struct FakeStore {
    rows: Vec<Row>,
    invocations: Vec<(String, TaskInvocation)>,
    fail: bool,
}

impl FakeStore {
    fn row(
        &mut self,
        domain: &str,
        request_id: &str,
        conversation_id: Uuid,
        branch_id: &str,
        current_message_hash: &str,
        parent_message_hash: Option<&str>,
        timestamp: DateTime<Utc>,
    ) {
        self.rows.push(Row {
            domain: domain.to_string(),
            timestamp,
            parent_message_hash: parent_message_hash.map(String::from),
            response_first_text: None,
            parent: ParentRequest {
                request_id: request_id.to_string(),
                conversation_id,
                branch_id: branch_id.to_string(),
                current_message_hash: current_message_hash.to_string(),
                system_hash: None,
            },
        });
    }
}

#[async_trait]
impl LinkExecutors for FakeStore {
    async fn find_parents(
        &self,
        criteria: &ParentCriteria,
    ) -> Result<Vec<ParentRequest>, LinkError> {
        if self.fail {
            return Err(LinkError::Store("injected failure".into()));
        }
        let mut matches: Vec<&Row> = self
            .rows
            .iter()
            .filter(|r| criteria.domain.is_empty() || r.domain == criteria.domain)
            .filter(|r| {
                criteria
                    .current_message_hash
                    .as_ref()
                    .is_none_or(|h| &r.parent.current_message_hash == h)
            })
            .filter(|r| {
                criteria
                    .parent_message_hash
                    .as_ref()
                    .is_none_or(|h| r.parent_message_hash.as_ref() == Some(h))
            })
            .filter(|r| {
                criteria
                    .system_hash
                    .as_ref()
                    .is_none_or(|h| r.parent.system_hash.as_ref() == Some(h))
            })
            .filter(|r| {
                criteria
                    .exclude_request_id
                    .as_ref()
                    .is_none_or(|id| &r.parent.request_id != id)
            })
            .filter(|r| {
                criteria
                    .before_timestamp
                    .is_none_or(|before| r.timestamp < before)
            })
            .filter(|r| {
                criteria
                    .conversation_id
                    .is_none_or(|c| r.parent.conversation_id == c)
            })
            .collect();
        matches.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then(b.parent.request_id.cmp(&a.parent.request_id))
        });
        Ok(matches.into_iter().map(|r| r.parent.clone()).collect())
    }

    async fn find_compact_parent(
        &self,
        domain: &str,
        normalized_summary: &str,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> Result<Option<ParentRequest>, LinkError> {
        if self.fail {
            return Err(LinkError::Store("injected failure".into()));
        }
        Ok(self
            .rows
            .iter()
            .filter(|r| r.domain == domain)
            .filter(|r| r.timestamp >= after && r.timestamp <= before)
            .find(|r| {
                r.response_first_text
                    .as_ref()
                    .is_some_and(|t| t.to_lowercase().starts_with(normalized_summary))
            })
            .map(|r| r.parent.clone()))
    }

    async fn find_by_id(&self, request_id: &str) -> Result<Option<ParentRequest>, LinkError> {
        Ok(self
            .rows
            .iter()
            .find(|r| r.parent.request_id == request_id)
            .map(|r| r.parent.clone()))
    }

    async fn recent_task_invocations(
        &self,
        domain: &str,
        before: DateTime<Utc>,
        prompt: Option<&str>,
    ) -> Result<Vec<TaskInvocation>, LinkError> {
        if self.fail {
            return Err(LinkError::Store("injected failure".into()));
        }
        Ok(self
            .invocations
            .iter()
            .filter(|(d, i)| d == domain && i.timestamp < before)
            .filter(|(_, i)| prompt.is_none_or(|p| i.prompt == p))
            .map(|(_, i)| i.clone())
            .collect())
    }

    async fn max_subtask_sequence(
        &self,
        conversation_id: Uuid,
        before: DateTime<Utc>,
    ) -> Result<u32, LinkError> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.parent.conversation_id == conversation_id && r.timestamp < before)
            .filter_map(|r| r.parent.branch_id.strip_prefix("subtask_"))
            .filter_map(|n| n.parse().ok())
            .max()
            .unwrap_or(0))
    }
}

fn user(text: &str) -> Value {
    json!({"role": "user", "content": text})
}

fn assistant(text: &str) -> Value {
    json!({"role": "assistant", "content": text})
}

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_754_000_000 + secs, 0).unwrap()
}

async fn link(
    store: FakeStore,
    domain: &str,
    messages: &[Value],
    request_id: &str,
    timestamp: DateTime<Utc>,
) -> braid_link::Linkage {
    let linker = ConversationLinker::new(Arc::new(store));
    linker
        .link(&LinkInput {
            domain,
            messages,
            system: None,
            request_id,
            timestamp,
        })
        .await
        .expect("link")
}

#[tokio::test]
async fn new_conversation_for_unknown_single_message() {
    let linkage = link(FakeStore::default(), "acme", &[user("Hello")], "req-1", ts(0)).await;
    assert!(linkage.conversation_id.is_none());
    assert_eq!(linkage.branch_id, "main");
    assert!(linkage.parent_message_hash.is_none());
    assert!(linkage.system_hash.is_none());
    assert!(!linkage.is_subtask);
}

#[tokio::test]
async fn direct_continuation_reuses_conversation_and_branch() {
    let messages = vec![user("first"), assistant("reply"), user("second")];
    let parent_hash = compute_hashes(&messages).parent.unwrap();
    let conversation = Uuid::new_v4();

    let mut store = FakeStore::default();
    store.row("acme", "req-0", conversation, "main", &parent_hash, None, ts(0));

    let linkage = link(store, "acme", &messages, "req-1", ts(60)).await;
    assert_eq!(linkage.conversation_id, Some(conversation));
    assert_eq!(linkage.parent_request_id.as_deref(), Some("req-0"));
    assert_eq!(linkage.branch_id, "main");
    assert_eq!(linkage.parent_message_hash.as_deref(), Some(parent_hash.as_str()));
}

#[tokio::test]
async fn second_child_opens_timestamped_branch() {
    let messages = vec![user("first"), assistant("reply"), user("second")];
    let parent_hash = compute_hashes(&messages).parent.unwrap();
    let conversation = Uuid::new_v4();

    let mut store = FakeStore::default();
    store.row("acme", "req-0", conversation, "main", &parent_hash, None, ts(0));
    // An existing sibling already descends from req-0.
    store.row(
        "acme",
        "req-1",
        conversation,
        "main",
        "other-hash",
        Some(&parent_hash),
        ts(30),
    );

    let now = ts(90);
    let linkage = link(store, "acme", &messages, "req-2", now).await;
    assert_eq!(linkage.conversation_id, Some(conversation));
    assert_eq!(linkage.parent_request_id.as_deref(), Some("req-0"));
    assert_eq!(
        linkage.branch_id,
        format!("branch_{}", now.format("%Y%m%d%H%M%S"))
    );
}

#[tokio::test]
async fn grandparent_fallback_keeps_computed_hashes() {
    let messages = vec![
        user("u0"),
        assistant("a0"),
        user("u1"),
        assistant("a1"),
        user("u2"),
    ];
    let hashes = compute_hashes(&messages);
    let grandparent_hash = hashes.grandparent.clone().unwrap();
    let conversation = Uuid::new_v4();

    let mut store = FakeStore::default();
    store.row(
        "acme",
        "req-g",
        conversation,
        "main",
        &grandparent_hash,
        None,
        ts(0),
    );

    let linkage = link(store, "acme", &messages, "req-9", ts(120)).await;
    assert_eq!(linkage.conversation_id, Some(conversation));
    assert_eq!(linkage.parent_request_id.as_deref(), Some("req-g"));
    assert_eq!(linkage.branch_id, "main");
    // The stored record keeps the linker's computed parent hash, not the
    // grandparent's.
    assert_eq!(linkage.parent_message_hash, hashes.parent);
}

#[tokio::test]
async fn subtask_inherits_conversation_and_sequences() {
    let conversation = Uuid::new_v4();
    let mut store = FakeStore::default();
    store.row("acme", "req-p", conversation, "main", "parent-hash", None, ts(0));
    // One earlier sub-task already exists in the conversation.
    store.row(
        "acme",
        "req-s1",
        conversation,
        "subtask_2",
        "sub-hash",
        None,
        ts(10),
    );
    for (n, tool_use_id) in [(1, "tu-1"), (2, "tu-2")] {
        store.invocations.push((
            "acme".to_string(),
            TaskInvocation {
                request_id: "req-p".to_string(),
                tool_use_id: tool_use_id.to_string(),
                prompt: "do X".to_string(),
                timestamp: ts(20 + n),
            },
        ));
    }

    let linkage = link(store, "acme", &[user("do X")], "req-9", ts(60)).await;
    assert!(linkage.is_subtask);
    assert_eq!(linkage.conversation_id, Some(conversation));
    assert_eq!(linkage.parent_task_request_id.as_deref(), Some("req-p"));
    // base = 2 (existing subtask_2), k = 1 for the first matching invocation.
    assert_eq!(linkage.branch_id, "subtask_3");
    assert_eq!(linkage.subtask_sequence, Some(3));
    assert!(linkage.parent_message_hash.is_none());
}

#[tokio::test]
async fn compact_continuation_lands_on_compact_branch() {
    let conversation = Uuid::new_v4();
    let mut store = FakeStore::default();
    store.row("acme", "req-old", conversation, "main", "old-hash", None, ts(0));
    store.rows[0].response_first_text =
        Some("We refactored the retry engine and added tests".to_string());

    let text = "This session is being continued from a previous conversation that ran out of \
                context. The conversation is summarized below: We refactored the retry engine.\n\
                Please continue the conversation from where we left it off.";
    let now = ts(3600);
    let linkage = link(store, "acme", &[user(text)], "req-9", now).await;
    assert_eq!(linkage.conversation_id, Some(conversation));
    assert_eq!(linkage.parent_request_id.as_deref(), Some("req-old"));
    assert_eq!(linkage.branch_id, format!("compact_{}", now.format("%H%M%S")));
    assert_eq!(linkage.parent_message_hash.as_deref(), Some("old-hash"));
}

#[tokio::test]
async fn compact_match_outside_window_is_ignored() {
    let conversation = Uuid::new_v4();
    let mut store = FakeStore::default();
    store.row("acme", "req-old", conversation, "main", "old-hash", None, ts(0));
    store.rows[0].response_first_text = Some("We refactored everything".to_string());

    let text = "This session is being continued from a previous conversation that ran out of \
                context. The conversation is summarized below: We refactored everything.";
    // Eight days later — past the seven-day window.
    let now = ts(0) + Duration::days(8);
    let linkage = link(store, "acme", &[user(text)], "req-9", now).await;
    assert!(linkage.conversation_id.is_none());
    assert_eq!(linkage.branch_id, "main");
}

#[tokio::test]
async fn descendants_of_compact_parent_inherit_branch() {
    let messages = vec![user("first"), assistant("reply"), user("second")];
    let parent_hash = compute_hashes(&messages).parent.unwrap();
    let conversation = Uuid::new_v4();

    let mut store = FakeStore::default();
    store.row(
        "acme",
        "req-c",
        conversation,
        "compact_101010",
        &parent_hash,
        None,
        ts(0),
    );
    // A sibling exists, which would normally force a new branch — compact
    // parents inherit regardless.
    store.row(
        "acme",
        "req-x",
        conversation,
        "compact_101010",
        "other",
        Some(&parent_hash),
        ts(5),
    );

    let linkage = link(store, "acme", &messages, "req-9", ts(60)).await;
    assert_eq!(linkage.branch_id, "compact_101010");
}

#[tokio::test]
async fn executor_failure_falls_back_to_new_conversation() {
    let messages = vec![user("first"), assistant("reply"), user("second")];
    let store = FakeStore {
        fail: true,
        ..Default::default()
    };
    let linkage = link(store, "acme", &messages, "req-9", ts(0)).await;
    assert!(linkage.conversation_id.is_none());
    assert_eq!(linkage.branch_id, "main");
    // Hashes are still computed locally.
    assert!(!linkage.current_message_hash.is_empty());
    assert!(linkage.parent_message_hash.is_some());
}

#[tokio::test]
async fn empty_messages_is_the_one_hard_error() {
    let linker = ConversationLinker::new(Arc::new(FakeStore::default()));
    let result = linker
        .link(&LinkInput {
            domain: "acme",
            messages: &[],
            system: None,
            request_id: "req-9",
            timestamp: ts(0),
        })
        .await;
    assert!(matches!(result, Err(LinkError::EmptyMessages)));
}

#[tokio::test]
async fn short_deduped_sequence_starts_new_conversation() {
    let messages = vec![user("only"), assistant("two")];
    let linkage = link(FakeStore::default(), "acme", &messages, "req-9", ts(0)).await;
    assert!(linkage.conversation_id.is_none());
    assert!(linkage.parent_message_hash.is_none());
}
