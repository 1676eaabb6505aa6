// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use conduit_config::AgentMode;
use conduit_model::StopReason;
use conduit_tools::{events::TodoItem, ToolCall};

/// Events emitted by the agent during a submit() call.
/// Consumers (CI runner, TUI) subscribe to these to drive their output.
///
/// Nesting follows the agent's own control flow: one `AgentStartEvent` /
/// `AgentEndEvent` pair brackets a whole `submit()`, each turn inside it is
/// bracketed by `TurnStartEvent` / `TurnEndEvent`, and each model call within
/// a turn is bracketed by `MessageStartEvent` / `MessageEndEvent`.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A submit() call has started processing.
    AgentStartEvent,
    /// A new turn (one model call plus any tool calls it triggers) has begun.
    TurnStartEvent { turn_index: u32 },
    /// The agent is about to stream a new assistant message from the model.
    MessageStartEvent,
    /// A text chunk streamed from the model
    TextDelta(String),
    /// A complete text response from the model (after streaming finishes)
    TextComplete(String),
    /// A thinking/reasoning chunk from the model (extended thinking API).
    /// Consumers should accumulate deltas and finalise them into a Thinking
    /// segment when the model signals the end of the reasoning block.
    ThinkingDelta(String),
    /// A complete thinking/reasoning block (accumulated from ThinkingDelta events).
    ThinkingComplete(String),
    /// The assistant message started by `MessageStartEvent` has finished
    /// streaming and been pushed onto the session.
    MessageEndEvent,
    /// The model has requested a tool call
    ToolExecutionStart(ToolCall),
    /// Incremental output from a running tool call. Tool execution is
    /// currently single-shot (no provider emits this yet); reserved for
    /// tools that stream partial output.
    ToolExecutionUpdate { call_id: String, chunk: String },
    /// A tool call finished
    ToolExecutionEnd {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// Context was compacted; statistics for the UI
    ContextCompacted {
        tokens_before: usize,
        tokens_after: usize,
    },
    /// Current token usage update
    TokenUsage {
        input: u32,
        output: u32,
        /// Tokens served from the provider's prompt cache this turn.
        cache_read: u32,
        /// Tokens written into the provider's prompt cache this turn.
        cache_write: u32,
        /// Running total of cache-read tokens across the whole session.
        cache_read_total: u32,
        /// Running total of cache-write tokens across the whole session.
        cache_write_total: u32,
        /// Context window size for the active model.
        max_tokens: usize,
    },
    /// The turn has finished; carries why the model stopped generating.
    TurnEndEvent { stop_reason: StopReason },
    /// A recoverable error occurred
    Error(String),
    /// The todo list was updated
    TodoUpdate(Vec<TodoItem>),
    /// The agent mode was changed
    ModeChanged(AgentMode),
    /// The agent is asking the user a question (id links to QuestionAnswer)
    Question { id: String, questions: Vec<String> },
    /// Answer to a previous Question event
    QuestionAnswer { id: String, answer: String },
    /// The submit() call has finished, either normally or via cancellation.
    AgentEndEvent { aborted: bool, partial_text: String },
    /// An extension's `toolWrapper` nested another layer around a tool.
    ToolWrapped { extension_id: String, tool_name: String },
}
