// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod compact;
mod events;
mod extensions;
mod pipeline;
mod prompts;
mod runtime_context;
mod session;
#[cfg(test)]
mod tests;

pub use agent::Agent;
pub use compact::{
    compact_session, compact_session_with_strategy, emergency_compact, smart_truncate,
};
pub use events::{AgentEvent, CompactionStrategyUsed};
pub use extensions::{ExtensionDefinition, ExtensionRunner, SlashCommandDefinition};
pub use pipeline::{
    convert_cross_provider_thinking, default_convert_to_llm, strip_synthetic,
    summarize_error_turns, synthesize_orphan_tool_results, transform_thinking_to_text,
};
pub use prompts::system_prompt;
pub use runtime_context::AgentRuntimeContext;
pub use session::{Session, TurnRecord};
