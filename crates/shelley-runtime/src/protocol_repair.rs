//! Tool-Call Protocol Repair (§4.2): normalizes an outgoing request's
//! message list so invariants 1-4 of §3 hold. Never mutates persisted
//! history — the Turn Loop calls this on a throwaway copy (§4.1 step 2).

use std::collections::HashSet;

use shelley_core::{Content, Role, ToolUseId};

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryMessage {
    pub role: Role,
    pub content: Vec<Content>,
}

impl HistoryMessage {
    pub fn new(role: Role, content: Vec<Content>) -> Self {
        Self { role, content }
    }
}

const NOT_EXECUTED_TEXT: &str = "not executed; retry possible";

fn synthetic_tool_result(id: &ToolUseId) -> Content {
    Content::tool_result(id.clone(), NOT_EXECUTED_TEXT, true)
}

/// Single left-to-right pass (§4.2). Idempotent: `repair(repair(h)) == repair(h)`.
pub fn repair(history: &[HistoryMessage]) -> Vec<HistoryMessage> {
    let mut out: Vec<HistoryMessage> = Vec::with_capacity(history.len());
    let mut pending: Vec<ToolUseId> = Vec::new();
    let last = history.len().saturating_sub(1);

    for (i, msg) in history.iter().enumerate() {
        match msg.role {
            Role::Assistant => {
                let is_final = i == last;
                let mut content = msg.content.clone();
                if content.is_empty() && !is_final {
                    content = vec![Content::text("(no response)")];
                }
                pending = content.iter().filter_map(|c| c.as_tool_use_id().cloned()).collect();
                out.push(HistoryMessage::new(Role::Assistant, content));

                let next_is_user = history.get(i + 1).map(|m| m.role == Role::User).unwrap_or(false);
                if !pending.is_empty() && !next_is_user {
                    let synthetic: Vec<Content> = pending.iter().map(synthetic_tool_result).collect();
                    out.push(HistoryMessage::new(Role::User, synthetic));
                    pending.clear();
                }
            }
            Role::User => {
                let mut satisfied: HashSet<ToolUseId> = HashSet::new();
                let mut kept: Vec<Content> = Vec::with_capacity(msg.content.len());
                for c in &msg.content {
                    match c.as_tool_result_id() {
                        Some(id) if pending.contains(id) => {
                            satisfied.insert(id.clone());
                            kept.push(c.clone());
                        }
                        Some(_) => {} // orphan tool_result, drop
                        None => kept.push(c.clone()),
                    }
                }

                let missing: Vec<Content> = pending
                    .iter()
                    .filter(|id| !satisfied.contains(*id))
                    .map(synthetic_tool_result)
                    .collect();

                let mut content = missing;
                content.extend(kept);
                pending.clear();

                if !content.is_empty() {
                    out.push(HistoryMessage::new(Role::User, content));
                }
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelley_core::ToolUseId;

    fn tid(s: &str) -> ToolUseId {
        ToolUseId::new(s)
    }

    #[test]
    fn orphan_tool_use_before_error_message_gets_synthetic_result() {
        let t1 = tid("T1");
        let history = vec![
            HistoryMessage::new(
                Role::Assistant,
                vec![Content::text("running"), Content::tool_use(t1.clone(), "bash", serde_json::json!({}))],
            ),
            HistoryMessage::new(Role::Assistant, vec![Content::text("oops")]),
            HistoryMessage::new(Role::User, vec![Content::text("retry")]),
        ];

        let repaired = repair(&history);

        assert_eq!(repaired.len(), 4);
        assert_eq!(repaired[1].role, Role::User);
        match &repaired[1].content[0] {
            Content::ToolResult { tool_use_id, is_error, .. } => {
                assert_eq!(tool_use_id, &t1);
                assert!(is_error);
            }
            other => panic!("expected ToolResult, got {other:?}"),
        }
        assert_eq!(repaired[2].content, vec![Content::text("oops")]);
        assert_eq!(repaired[3].content, vec![Content::text("retry")]);
    }

    #[test]
    fn orphan_tool_result_is_dropped_and_missing_ones_prepended() {
        let t1 = tid("T1");
        let t2 = tid("T2");
        let stray = tid("STRAY");
        let history = vec![
            HistoryMessage::new(
                Role::Assistant,
                vec![
                    Content::tool_use(t1.clone(), "a", serde_json::json!({})),
                    Content::tool_use(t2.clone(), "b", serde_json::json!({})),
                ],
            ),
            HistoryMessage::new(
                Role::User,
                vec![
                    Content::tool_result(stray.clone(), "leftover", false),
                    Content::tool_result(t1.clone(), "ok", false),
                ],
            ),
        ];

        let repaired = repair(&history);

        assert_eq!(repaired.len(), 2);
        let ids: Vec<&ToolUseId> = repaired[1].content.iter().filter_map(|c| c.as_tool_result_id()).collect();
        assert_eq!(ids, vec![&t2, &t1]);
    }

    #[test]
    fn user_message_emptied_by_filtering_is_dropped() {
        let stray = tid("STRAY");
        let history = vec![
            HistoryMessage::new(Role::Assistant, vec![Content::text("hi")]),
            HistoryMessage::new(Role::User, vec![Content::tool_result(stray, "leftover", false)]),
        ];

        let repaired = repair(&history);

        assert_eq!(repaired.len(), 1);
        assert_eq!(repaired[0].role, Role::Assistant);
    }

    #[test]
    fn empty_non_final_assistant_message_gets_placeholder() {
        let history = vec![
            HistoryMessage::new(Role::Assistant, vec![]),
            HistoryMessage::new(Role::User, vec![Content::text("continue")]),
        ];

        let repaired = repair(&history);

        assert_eq!(repaired[0].content, vec![Content::text("(no response)")]);
    }

    #[test]
    fn empty_final_assistant_message_is_left_alone() {
        let history = vec![HistoryMessage::new(Role::Assistant, vec![])];
        let repaired = repair(&history);
        assert_eq!(repaired[0].content, Vec::<Content>::new());
    }

    #[test]
    fn repair_is_idempotent() {
        let t1 = tid("T1");
        let history = vec![
            HistoryMessage::new(
                Role::Assistant,
                vec![Content::text("running"), Content::tool_use(t1.clone(), "bash", serde_json::json!({}))],
            ),
            HistoryMessage::new(Role::Assistant, vec![Content::text("oops")]),
            HistoryMessage::new(Role::User, vec![Content::text("retry")]),
        ];

        let once = repair(&history);
        let twice = repair(&once);
        assert_eq!(once, twice);
    }
}
