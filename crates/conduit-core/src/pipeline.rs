// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0

//! Pure transforms applied to a session's message list before it is sent to
//! a model provider. Each transform takes `&[Message]` and returns a new
//! `Vec<Message>` — none mutate the session directly, so they can be
//! composed, tested, and reordered independently of `Session`/`Agent`.

use std::collections::HashSet;

use conduit_model::{Message, MessageContent, Role, StopReason};

/// Insert a synthetic, already-failed tool result for every tool call that
/// never received one.
///
/// A tool call can go unanswered when the agent loop is cancelled between
/// dispatching a tool and recording its result, or when history is spliced
/// (branch switch, manual edit) in a way that drops the matching result.
/// Left unmatched, such a call makes the next request to most providers
/// invalid (Anthropic/OpenAI both require every `tool_use`/`tool_call` id in
/// one assistant turn to have a corresponding result before the next model
/// turn). This walks the history once, grouping each assistant turn's
/// consecutive tool-call messages together with the tool-result messages
/// that follow (up to the next assistant message), and backfills a
/// synthetic aborted result for any id in that group left unmatched.
pub fn synthesize_orphan_tool_results(messages: &[Message]) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    let mut i = 0;
    while i < messages.len() {
        let is_tool_call = messages[i].role == Role::Assistant
            && matches!(messages[i].content, MessageContent::ToolCall { .. });
        if !is_tool_call {
            out.push(messages[i].clone());
            i += 1;
            continue;
        }

        // Collect this turn's run of tool-call messages and their (id, name) pairs.
        let mut calls: Vec<(String, String)> = Vec::new();
        while i < messages.len() {
            let MessageContent::ToolCall {
                tool_call_id,
                function,
            } = &messages[i].content
            else {
                break;
            };
            if messages[i].role != Role::Assistant {
                break;
            }
            calls.push((tool_call_id.clone(), function.name.clone()));
            out.push(messages[i].clone());
            i += 1;
        }

        // Scan forward over this turn's results, up to the next assistant
        // message (the start of the following turn) or end of history.
        let mut matched: HashSet<String> = HashSet::new();
        while i < messages.len() && messages[i].role != Role::Assistant {
            if let MessageContent::ToolResult { tool_call_id, .. } = &messages[i].content {
                matched.insert(tool_call_id.clone());
            }
            out.push(messages[i].clone());
            i += 1;
        }

        for (id, name) in &calls {
            if !matched.contains(id) {
                out.push(Message::tool_result(
                    id,
                    format!("Tool call aborted. ({name})"),
                ));
            }
        }
    }
    out
}

/// When the last assistant message ended the turn in an error, collapse the
/// whole failed turn — back to the user message that triggered it — into a
/// single synthetic user message summarising what was attempted and why it
/// failed. Leaving the raw error exchange in history wastes context on a
/// turn that produced nothing usable and, for providers that reject a
/// trailing error turn outright, would block the next request entirely.
pub fn summarize_error_turns(messages: &[Message]) -> Vec<Message> {
    let Some(last) = messages.last() else {
        return messages.to_vec();
    };
    if last.role != Role::Assistant || last.stop_reason != Some(StopReason::Error) {
        return messages.to_vec();
    }
    let Some(trigger_idx) = messages.iter().rposition(|m| m.role == Role::User) else {
        return messages.to_vec();
    };

    let tool_names: Vec<&str> = messages[trigger_idx + 1..]
        .iter()
        .filter_map(|m| match &m.content {
            MessageContent::ToolCall { function, .. } => Some(function.name.as_str()),
            _ => None,
        })
        .collect();
    let error_text = last.as_text().unwrap_or("unknown error");

    let mut summary = String::from("The previous tool exchange failed");
    if !tool_names.is_empty() {
        summary.push_str(&format!(" using: {}", tool_names.join(", ")));
    }
    summary.push_str(&format!(". Error: {error_text}"));

    let mut out = messages[..=trigger_idx].to_vec();
    out.push(Message::user(summary));
    out
}

/// Convert every `Thinking` block to a plain `Text` block wrapped in
/// `<thinking>...</thinking>`, dropping the provider's thinking signature.
/// Used when replaying history to a provider that does not support
/// extended-thinking round-tripping.
pub fn transform_thinking_to_text(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .map(|m| match &m.content {
            MessageContent::Thinking { thinking, .. } => Message {
                role: m.role,
                content: MessageContent::Text(format!("<thinking>{thinking}</thinking>")),
                stop_reason: m.stop_reason,
                usage: m.usage.clone(),
            },
            _ => m.clone(),
        })
        .collect()
}

/// Same as [`transform_thinking_to_text`], applied only when the target
/// provider for the next request differs from the one that produced the
/// history (`provider_changed`). A thinking block's signature is only valid
/// for the provider that issued it — replaying it against a different
/// provider would either be rejected or silently ignored, so this textifies
/// it instead of carrying a dead signature forward.
pub fn convert_cross_provider_thinking(messages: &[Message], provider_changed: bool) -> Vec<Message> {
    if !provider_changed {
        return messages.to_vec();
    }
    transform_thinking_to_text(messages)
}

/// Drop the synthetic journal-only variants (`Custom`/`BashExecution`/
/// `BranchSummary`/`CompactionSummary`) before building a request. These
/// exist purely for the session journal/UI and were never meant to reach a
/// provider.
pub fn strip_synthetic(messages: &[Message]) -> Vec<Message> {
    messages.iter().filter(|m| !m.is_synthetic()).cloned().collect()
}

/// The default request-time conversion pipeline, applied to `session.messages`
/// before every model call: strip synthetic entries, summarise a trailing
/// error turn, backfill orphaned tool results, then normalise thinking for
/// the target provider. Order matters — stripping synthetic entries first
/// keeps the error-turn and orphan scans from tripping over journal-only
/// messages that were never part of a real turn.
pub fn default_convert_to_llm(messages: &[Message], provider_changed: bool) -> Vec<Message> {
    let messages = strip_synthetic(messages);
    let messages = summarize_error_turns(&messages);
    let messages = synthesize_orphan_tool_results(&messages);
    convert_cross_provider_thinking(&messages, provider_changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_model::{FunctionCall, StopReason, Usage};

    fn tool_call(id: &str, name: &str) -> Message {
        Message {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                tool_call_id: id.to_string(),
                function: FunctionCall {
                    name: name.to_string(),
                    arguments: "{}".to_string(),
                },
            },
            ..Default::default()
        }
    }

    #[test]
    fn orphan_synthesis_leaves_matched_calls_untouched() {
        let messages = vec![
            Message::user("do it"),
            tool_call("c1", "shell"),
            Message::tool_result("c1", "ok"),
        ];
        let out = synthesize_orphan_tool_results(&messages);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn orphan_synthesis_backfills_unmatched_call() {
        let messages = vec![Message::user("do it"), tool_call("c1", "shell")];
        let out = synthesize_orphan_tool_results(&messages);
        assert_eq!(out.len(), 3);
        match &out[2].content {
            MessageContent::ToolResult {
                tool_call_id,
                content,
            } => {
                assert_eq!(tool_call_id, "c1");
                assert!(content.as_text().unwrap().contains("aborted"));
            }
            other => panic!("expected synthetic tool result, got {other:?}"),
        }
    }

    #[test]
    fn orphan_synthesis_handles_parallel_calls_with_one_missing() {
        let messages = vec![
            Message::user("do both"),
            tool_call("c1", "shell"),
            tool_call("c2", "fs"),
            Message::tool_result("c1", "ok"),
        ];
        let out = synthesize_orphan_tool_results(&messages);
        // user, two calls, one real result, one synthetic result for c2
        assert_eq!(out.len(), 5);
        let synthetic = out.last().unwrap();
        match &synthetic.content {
            MessageContent::ToolResult { tool_call_id, .. } => assert_eq!(tool_call_id, "c2"),
            other => panic!("expected synthetic tool result, got {other:?}"),
        }
    }

    #[test]
    fn orphan_synthesis_does_not_match_results_past_next_assistant_turn() {
        let messages = vec![
            Message::user("first"),
            tool_call("c1", "shell"),
            Message::assistant("moving on without a result"),
            Message::tool_result("c1", "too late"),
        ];
        let out = synthesize_orphan_tool_results(&messages);
        // The real result arrives after the next assistant message, so it
        // does not count as a match — a synthetic result is inserted
        // immediately after the tool-call run instead.
        let synthetic_idx = out
            .iter()
            .position(|m| matches!(&m.content, MessageContent::ToolResult { content, .. } if content.as_text().unwrap().contains("aborted")));
        assert!(synthetic_idx.is_some());
    }

    #[test]
    fn error_turn_summarised_back_to_triggering_user_message() {
        let messages = vec![
            Message::user("run the build"),
            tool_call("c1", "build"),
            Message::tool_result("c1", "build failed: exit 1"),
            Message::assistant_with_result("", StopReason::Error, Usage::default()),
        ];
        let out = summarize_error_turns(&messages);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].role, Role::User);
        assert_eq!(out[0].as_text().unwrap(), "run the build");
        assert_eq!(out[1].role, Role::User);
        assert!(out[1].as_text().unwrap().contains("build"));
    }

    #[test]
    fn error_turn_summarisation_is_a_no_op_when_last_turn_succeeded() {
        let messages = vec![Message::user("hi"), Message::assistant("hello")];
        let out = summarize_error_turns(&messages);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn thinking_converts_to_wrapped_text() {
        let messages = vec![Message {
            role: Role::Assistant,
            content: MessageContent::Thinking {
                thinking: "let me consider".to_string(),
                thinking_signature: Some("sig".to_string()),
            },
            ..Default::default()
        }];
        let out = transform_thinking_to_text(&messages);
        match &out[0].content {
            MessageContent::Text(t) => assert_eq!(t, "<thinking>let me consider</thinking>"),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn cross_provider_thinking_is_a_no_op_when_provider_unchanged() {
        let messages = vec![Message {
            role: Role::Assistant,
            content: MessageContent::Thinking {
                thinking: "thought".to_string(),
                thinking_signature: Some("sig".to_string()),
            },
            ..Default::default()
        }];
        let out = convert_cross_provider_thinking(&messages, false);
        assert!(matches!(out[0].content, MessageContent::Thinking { .. }));
    }

    #[test]
    fn strip_synthetic_removes_journal_only_variants() {
        let messages = vec![
            Message::user("hi"),
            Message::bash_execution("ls", "a.txt", Some(0)),
            Message::assistant("hello"),
        ];
        let out = strip_synthetic(&messages);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|m| !m.is_synthetic()));
    }

    #[test]
    fn orphan_call_followed_by_unrelated_assistant_text_gets_aborted_result_inserted_first() {
        let messages = vec![
            Message::user("go"),
            tool_call("c1", "bash"),
            Message::assistant("continued"),
        ];
        let out = synthesize_orphan_tool_results(&messages);
        assert_eq!(out.len(), 4);
        match &out[2].content {
            MessageContent::ToolResult {
                tool_call_id,
                content,
            } => {
                assert_eq!(tool_call_id, "c1");
                assert!(content.as_text().unwrap().contains("aborted"));
            }
            other => panic!("expected synthetic tool result immediately after the call, got {other:?}"),
        }
        assert_eq!(out[3].as_text().unwrap(), "continued");
    }

    #[test]
    fn error_turn_summary_names_the_failed_tool_and_error_text() {
        let messages = vec![
            Message::user("do"),
            tool_call("c1", "bash"),
            Message::tool_result("c1", "output"),
            Message::assistant_with_result("broke", StopReason::Error, Usage::default()),
        ];
        let out = summarize_error_turns(&messages);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_text().unwrap(), "do");
        let summary = out[1].as_text().unwrap();
        assert!(summary.contains("previous tool exchange failed"));
        assert!(summary.contains("bash"));
        assert!(summary.contains("broke"));
    }

    #[test]
    fn default_pipeline_is_idempotent_on_a_well_formed_history() {
        let messages = vec![
            Message::user("run it"),
            tool_call("c1", "shell"),
            Message::tool_result("c1", "ok"),
            Message::assistant("done"),
        ];
        let once = default_convert_to_llm(&messages, false);
        let twice = default_convert_to_llm(&once, false);
        assert_eq!(format!("{once:?}"), format!("{twice:?}"));
    }

    #[test]
    fn cross_provider_thinking_is_idempotent_once_already_textified() {
        let messages = vec![Message {
            role: Role::Assistant,
            content: MessageContent::Thinking {
                thinking: "thought".to_string(),
                thinking_signature: Some("sig".to_string()),
            },
            ..Default::default()
        }];
        let once = convert_cross_provider_thinking(&messages, true);
        let twice = convert_cross_provider_thinking(&once, true);
        assert_eq!(format!("{once:?}"), format!("{twice:?}"));
    }

    #[test]
    fn default_pipeline_composes_all_four_passes() {
        let messages = vec![
            Message::user("run it"),
            Message::bash_execution("ls", "a.txt", Some(0)),
            tool_call("c1", "shell"),
        ];
        let out = default_convert_to_llm(&messages, false);
        // bash_execution stripped, orphan c1 backfilled
        assert_eq!(out.len(), 3);
        assert!(!out.iter().any(|m| m.is_synthetic()));
        assert!(out
            .iter()
            .any(|m| matches!(&m.content, MessageContent::ToolResult { tool_call_id, .. } if tool_call_id == "c1")));
    }
}
