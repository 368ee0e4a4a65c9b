//! Built-in plugins shipped with the core. Currently the `permission`
//! management command.

use async_trait::async_trait;
use murmur_core::{Error, MessageEnvelope, Result, Segment};
use std::sync::Arc;

use crate::command::CommandArgs;
use crate::component::{CommandLike, ComponentContext, ComponentImpl, ComponentInfo, ComponentKind};
use crate::plugin::{Plugin, PluginContext};

pub const MANAGE_NODE: &str = "core.permission.manage";

pub struct PermissionPlugin;

#[async_trait]
impl Plugin for PermissionPlugin {
    fn name(&self) -> &str {
        "permission"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn components(&self) -> Vec<(ComponentInfo, ComponentImpl)> {
        vec![(
            ComponentInfo::new("permission", ComponentKind::Command).with_metadata(
                serde_json::json!({
                    "verb": "permission",
                    "subcommands": ["grant", "revoke", "list", "check", "nodes", "help"],
                }),
            ),
            ComponentImpl::Command(Arc::new(PermissionCommand)),
        )]
    }

    async fn on_load(&self, ctx: &PluginContext) -> Result<()> {
        ctx.permissions.store().register_node(
            MANAGE_NODE,
            self.name(),
            "Grant and revoke permission nodes",
            false,
        )
    }
}

struct PermissionCommand;

const HELP_TEXT: &str = "permission <grant|revoke|list|check|nodes|help>\n\
  grant <platform> <user> <node>   grant a node to a user\n\
  revoke <platform> <user> <node>  revoke a node from a user\n\
  list <platform> <user>           list a user's explicit grants\n\
  check <platform> <user> <node>   test whether a user holds a node\n\
  nodes                            list all registered nodes";

#[async_trait]
impl CommandLike for PermissionCommand {
    fn verb(&self) -> &str {
        "permission"
    }

    fn usage(&self) -> &str {
        HELP_TEXT
    }

    fn required_node(&self, args: &CommandArgs) -> Option<String> {
        match args.subcommand() {
            Some("grant") | Some("revoke") => Some(MANAGE_NODE.to_string()),
            _ => None,
        }
    }

    async fn execute(
        &self,
        ctx: &ComponentContext,
        _envelope: &MessageEnvelope,
        args: &CommandArgs,
    ) -> Result<Segment> {
        let store = ctx.permissions.store();
        let reply = match args.subcommand() {
            Some("grant") => {
                let (platform, user, node) = three_args(args)?;
                store.grant(platform, user, node)?;
                format!("Granted `{}` to {}:{}", node, platform, user)
            }
            Some("revoke") => {
                let (platform, user, node) = three_args(args)?;
                if store.revoke(platform, user, node)? {
                    format!("Revoked `{}` from {}:{}", node, platform, user)
                } else {
                    format!("{}:{} did not hold `{}`", platform, user, node)
                }
            }
            Some("list") => {
                let platform = arg(args, 0)?;
                let user = arg(args, 1)?;
                let nodes = store.list_user(platform, user)?;
                if nodes.is_empty() {
                    format!("{}:{} holds no explicit grants", platform, user)
                } else {
                    format!("{}:{} holds: {}", platform, user, nodes.join(", "))
                }
            }
            Some("check") => {
                let (platform, user, node) = three_args(args)?;
                let held = ctx.permissions.is_master(platform, user)
                    || store.check(platform, user, node)?;
                format!(
                    "{}:{} {} `{}`",
                    platform,
                    user,
                    if held { "holds" } else { "does not hold" },
                    node
                )
            }
            Some("nodes") => {
                let nodes = store.nodes()?;
                if nodes.is_empty() {
                    "No permission nodes registered".to_string()
                } else {
                    nodes
                        .iter()
                        .map(|n| {
                            format!(
                                "{} ({}) default={}",
                                n.node_name,
                                n.plugin,
                                if n.default_grant { "grant" } else { "deny" }
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            _ => HELP_TEXT.to_string(),
        };
        Ok(Segment::text(&reply))
    }
}

fn arg<'a>(args: &'a CommandArgs, idx: usize) -> Result<&'a str> {
    args.arg(idx)
        .ok_or_else(|| Error::Other(format!("missing argument; usage:\n{}", HELP_TEXT)))
}

fn three_args<'a>(args: &'a CommandArgs) -> Result<(&'a str, &'a str, &'a str)> {
    Ok((arg(args, 0)?, arg(args, 1)?, arg(args, 2)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginConfig;
    use crate::permission::PermissionGate;
    use murmur_core::config::PermissionConfig;
    use murmur_core::{MessageInfo, MessageKind, UserInfo};
    use murmur_storage::{Database, PermissionStore};

    fn context() -> ComponentContext {
        let store = Arc::new(PermissionStore::new(Database::open_in_memory().unwrap()));
        ComponentContext {
            plugin: "permission".to_string(),
            config: Arc::new(PluginConfig::default()),
            permissions: Arc::new(PermissionGate::new(store, PermissionConfig::default())),
        }
    }

    fn envelope() -> MessageEnvelope {
        MessageEnvelope::incoming(
            "qq",
            "m1",
            MessageInfo {
                message_type: MessageKind::Private,
                user: UserInfo::new("1"),
                group: None,
                self_id: "bot".to_string(),
                to_me: true,
            },
            Segment::text("/permission nodes"),
        )
    }

    #[tokio::test]
    async fn test_grant_check_revoke_flow() {
        let ctx = context();
        let cmd = PermissionCommand;
        let env = envelope();

        let grant = CommandArgs::parse("permission grant qq 9 plugin.example.admin").unwrap();
        cmd.execute(&ctx, &env, &grant).await.unwrap();

        let check = CommandArgs::parse("permission check qq 9 plugin.example.admin").unwrap();
        let reply = cmd.execute(&ctx, &env, &check).await.unwrap();
        assert!(reply.plain_text().contains("holds"));

        let revoke = CommandArgs::parse("permission revoke qq 9 plugin.example.admin").unwrap();
        cmd.execute(&ctx, &env, &revoke).await.unwrap();
        let reply = cmd.execute(&ctx, &env, &check).await.unwrap();
        assert!(reply.plain_text().contains("does not hold"));
    }

    #[tokio::test]
    async fn test_required_node_only_for_mutations() {
        let cmd = PermissionCommand;
        let grant = CommandArgs::parse("permission grant qq 9 n").unwrap();
        let list = CommandArgs::parse("permission list qq 9").unwrap();
        let help = CommandArgs::parse("permission help").unwrap();
        assert_eq!(cmd.required_node(&grant).as_deref(), Some(MANAGE_NODE));
        assert_eq!(cmd.required_node(&list), None);
        assert_eq!(cmd.required_node(&help), None);
    }

    #[tokio::test]
    async fn test_help_on_unknown_subcommand() {
        let ctx = context();
        let cmd = PermissionCommand;
        let args = CommandArgs::parse("permission frobnicate").unwrap();
        let reply = cmd.execute(&ctx, &envelope(), &args).await.unwrap();
        assert!(reply.plain_text().contains("grant <platform>"));
    }
}
