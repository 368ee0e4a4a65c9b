use async_trait::async_trait;
use murmur_core::{MessageEnvelope, Result, Segment};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::command::CommandArgs;
use crate::config::PluginConfig;
use crate::permission::PermissionGate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Action,
    Command,
    PlusCommand,
    Tool,
    EventHandler,
    InterestCalculator,
    Prompt,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Action => "action",
            ComponentKind::Command => "command",
            ComponentKind::PlusCommand => "plus_command",
            ComponentKind::Tool => "tool",
            ComponentKind::EventHandler => "event_handler",
            ComponentKind::InterestCalculator => "interest_calculator",
            ComponentKind::Prompt => "prompt",
        }
    }
}

/// Registry-facing description of one component. `metadata` carries the
/// kind-specific declaration (an action's trigger, a command's verb and
/// argument shape, an event handler's subscriptions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentInfo {
    pub name: String,
    pub kind: ComponentKind,
    /// Owning plugin; filled in by the host at registration time.
    #[serde(default)]
    pub plugin: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub metadata: Value,
}

fn default_true() -> bool {
    true
}

impl ComponentInfo {
    pub fn new(name: &str, kind: ComponentKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            plugin: String::new(),
            enabled: true,
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Shared services handed to component implementations at invocation time.
#[derive(Clone)]
pub struct ComponentContext {
    pub plugin: String,
    pub config: Arc<PluginConfig>,
    pub permissions: Arc<PermissionGate>,
}

#[async_trait]
pub trait ActionLike: Send + Sync {
    /// Prompt template injected when the reply generator considers this
    /// action.
    fn prompt_template(&self) -> &str;

    /// Run the action; `Some` replaces the default reply.
    async fn execute(
        &self,
        ctx: &ComponentContext,
        envelope: &MessageEnvelope,
    ) -> Result<Option<Segment>>;
}

#[async_trait]
pub trait CommandLike: Send + Sync {
    fn verb(&self) -> &str;

    fn usage(&self) -> &str {
        ""
    }

    /// Permission node guarding this invocation, if any. Consulted by the
    /// permission middleware before `execute`.
    fn required_node(&self, _args: &CommandArgs) -> Option<String> {
        None
    }

    async fn execute(
        &self,
        ctx: &ComponentContext,
        envelope: &MessageEnvelope,
        args: &CommandArgs,
    ) -> Result<Segment>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[async_trait]
pub trait ToolLike: Send + Sync {
    fn schema(&self) -> ToolSchema;

    async fn invoke(&self, ctx: &ComponentContext, params: Value) -> Result<Value>;
}

/// Declared subscription of an event-handler component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    pub event_name: String,
    #[serde(default)]
    pub weight: i32,
    #[serde(default)]
    pub intercept: bool,
    #[serde(default = "default_group")]
    pub permission_group: String,
}

fn default_group() -> String {
    murmur_core::events::SYSTEM_GROUP.to_string()
}

pub trait EventHandlerLike: murmur_events::EventHandler {
    fn subscriptions(&self) -> Vec<SubscriptionSpec>;
}

#[async_trait]
pub trait InterestCalculatorLike: Send + Sync {
    /// Interest score in [0, 1] for a group message the bot was not
    /// addressed in.
    async fn interest(&self, envelope: &MessageEnvelope) -> Result<f32>;
}

#[async_trait]
pub trait PromptLike: Send + Sync {
    /// Optional prompt section contributed to reply generation.
    async fn render(&self, envelope: &MessageEnvelope) -> Result<Option<String>>;
}

#[derive(Clone)]
pub enum ComponentImpl {
    Action(Arc<dyn ActionLike>),
    Command(Arc<dyn CommandLike>),
    PlusCommand(Arc<dyn CommandLike>),
    Tool(Arc<dyn ToolLike>),
    EventHandler(Arc<dyn EventHandlerLike>),
    InterestCalculator(Arc<dyn InterestCalculatorLike>),
    Prompt(Arc<dyn PromptLike>),
}

impl ComponentImpl {
    pub fn kind(&self) -> ComponentKind {
        match self {
            ComponentImpl::Action(_) => ComponentKind::Action,
            ComponentImpl::Command(_) => ComponentKind::Command,
            ComponentImpl::PlusCommand(_) => ComponentKind::PlusCommand,
            ComponentImpl::Tool(_) => ComponentKind::Tool,
            ComponentImpl::EventHandler(_) => ComponentKind::EventHandler,
            ComponentImpl::InterestCalculator(_) => ComponentKind::InterestCalculator,
            ComponentImpl::Prompt(_) => ComponentKind::Prompt,
        }
    }
}
