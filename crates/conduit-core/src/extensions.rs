// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Extension pipeline: before/after-agent hooks, context transforms, and
//! tool wrappers contributed by extensions, composed and run by an
//! [`ExtensionRunner`].

use std::sync::Arc;

use conduit_model::Message;
use conduit_tools::{Tool, ToolRegistry};

use crate::{events::AgentEvent, runtime_context::AgentRuntimeContext};

/// A custom slash command an extension contributes to the shared registry.
#[derive(Debug, Clone)]
pub struct SlashCommandDefinition {
    pub name: String,
    pub description: String,
}

type BeforeAgentHook = Arc<dyn Fn(Vec<Message>) -> Vec<Message> + Send + Sync>;
type AfterAgentHook = Arc<dyn Fn(&[Message]) + Send + Sync>;
type TransformContextHook = Arc<dyn Fn(AgentRuntimeContext) -> AgentRuntimeContext + Send + Sync>;
type ToolWrapperHook = Arc<dyn Fn(Arc<dyn Tool>) -> Arc<dyn Tool> + Send + Sync>;

/// One loaded extension's contributed hooks. All fields are optional — an
/// extension may implement only the hooks it needs.
#[derive(Clone, Default)]
pub struct ExtensionDefinition {
    pub id: String,
    pub before_agent: Option<BeforeAgentHook>,
    pub after_agent: Option<AfterAgentHook>,
    pub transform_context: Option<TransformContextHook>,
    pub tool_wrapper: Option<ToolWrapperHook>,
    pub register_commands: Vec<SlashCommandDefinition>,
}

impl ExtensionDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), ..Default::default() }
    }

    pub fn with_before_agent<F>(mut self, hook: F) -> Self
    where
        F: Fn(Vec<Message>) -> Vec<Message> + Send + Sync + 'static,
    {
        self.before_agent = Some(Arc::new(hook));
        self
    }

    pub fn with_after_agent<F>(mut self, hook: F) -> Self
    where
        F: Fn(&[Message]) + Send + Sync + 'static,
    {
        self.after_agent = Some(Arc::new(hook));
        self
    }

    pub fn with_transform_context<F>(mut self, hook: F) -> Self
    where
        F: Fn(AgentRuntimeContext) -> AgentRuntimeContext + Send + Sync + 'static,
    {
        self.transform_context = Some(Arc::new(hook));
        self
    }

    pub fn with_tool_wrapper<F>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<dyn Tool>) -> Arc<dyn Tool> + Send + Sync + 'static,
    {
        self.tool_wrapper = Some(Arc::new(hook));
        self
    }

    pub fn with_command(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.register_commands.push(SlashCommandDefinition {
            name: name.into(),
            description: description.into(),
        });
        self
    }
}

impl std::fmt::Debug for ExtensionDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionDefinition")
            .field("id", &self.id)
            .field("before_agent", &self.before_agent.is_some())
            .field("after_agent", &self.after_agent.is_some())
            .field("transform_context", &self.transform_context.is_some())
            .field("tool_wrapper", &self.tool_wrapper.is_some())
            .field("register_commands", &self.register_commands.len())
            .finish()
    }
}

/// Registers extensions in load order and runs their hooks per the
/// composition rules in spec §4.J.
#[derive(Clone, Default)]
pub struct ExtensionRunner {
    extensions: Vec<ExtensionDefinition>,
}

impl ExtensionRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an extension. Later registrations run later in `beforeAgent`/
    /// `transformContext` chains and end up outermost in `toolWrapper` nesting.
    pub fn register(&mut self, extension: ExtensionDefinition) {
        self.extensions.push(extension);
    }

    /// Run every `beforeAgent` hook in load order, each receiving the
    /// previous hook's output.
    pub fn run_before_agent(&self, messages: Vec<Message>) -> Vec<Message> {
        self.extensions.iter().fold(messages, |acc, ext| match &ext.before_agent {
            Some(hook) => hook(acc),
            None => acc,
        })
    }

    /// Run every `afterAgent` hook in load order, unconditionally.
    pub fn run_after_agent(&self, messages: &[Message]) {
        for ext in &self.extensions {
            if let Some(hook) = &ext.after_agent {
                hook(messages);
            }
        }
    }

    /// Run every `transformContext` hook in load order, each receiving the
    /// previous hook's output.
    pub fn run_transform_context(&self, ctx: AgentRuntimeContext) -> AgentRuntimeContext {
        self.extensions
            .iter()
            .fold(ctx, |acc, ext| match &ext.transform_context {
                Some(hook) => hook(acc),
                None => acc,
            })
    }

    /// Wrap every tool currently in `registry` with every extension's
    /// `toolWrapper`, nesting in load order so the last-loaded extension ends
    /// up outermost. Replaces each tool in place and returns one
    /// `AgentEvent::ToolWrapped` per wrap applied, for the caller to forward
    /// on its event stream.
    pub fn wrap_tools(&self, registry: &mut ToolRegistry) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        for name in registry.names() {
            let Some(mut tool) = registry.get(&name) else { continue };
            for ext in &self.extensions {
                if let Some(wrapper) = &ext.tool_wrapper {
                    tool = wrapper(tool);
                    events.push(AgentEvent::ToolWrapped {
                        extension_id: ext.id.clone(),
                        tool_name: name.clone(),
                    });
                }
            }
            registry.register_arc(name, tool);
        }
        events
    }

    /// All custom slash commands contributed by registered extensions, in
    /// load order.
    pub fn commands(&self) -> Vec<SlashCommandDefinition> {
        self.extensions
            .iter()
            .flat_map(|ext| ext.register_commands.iter().cloned())
            .collect()
    }
}
