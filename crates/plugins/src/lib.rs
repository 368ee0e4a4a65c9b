pub mod builtin;
pub mod command;
pub mod component;
pub mod config;
pub mod deps;
pub mod host;
pub mod permission;
pub mod plugin;
pub mod registry;

pub use command::CommandArgs;
pub use component::{
    ActionLike, CommandLike, ComponentContext, ComponentImpl, ComponentInfo, ComponentKind,
    EventHandlerLike, InterestCalculatorLike, PromptLike, SubscriptionSpec, ToolLike, ToolSchema,
};
pub use config::PluginConfig;
pub use deps::{DependencyInstaller, DependencyResolver, NullInstaller};
pub use host::PluginHost;
pub use permission::PermissionGate;
pub use plugin::{ConfigField, Plugin, PluginContext, PluginDependency, PluginManifest, PluginState};
pub use registry::{ComponentRecord, ComponentRegistry};
