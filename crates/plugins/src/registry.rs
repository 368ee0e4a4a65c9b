use murmur_core::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::component::{
    ActionLike, CommandLike, ComponentImpl, ComponentInfo, ComponentKind, InterestCalculatorLike,
    PromptLike, ToolLike,
};

#[derive(Clone)]
pub struct ComponentRecord {
    pub info: ComponentInfo,
    pub implementation: ComponentImpl,
}

/// Component records keyed by `(kind, name)`. Reads dominate: lookups happen
/// on every message, writes only during plugin lifecycle.
pub struct ComponentRegistry {
    inner: RwLock<HashMap<(ComponentKind, String), ComponentRecord>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        plugin: &str,
        mut info: ComponentInfo,
        implementation: ComponentImpl,
    ) -> Result<()> {
        if info.kind != implementation.kind() {
            return Err(Error::PluginLoad(format!(
                "component '{}' declares kind {:?} but implements {:?}",
                info.name,
                info.kind,
                implementation.kind()
            )));
        }
        info.plugin = plugin.to_string();
        let key = (info.kind, info.name.clone());
        let mut map = self.inner.write().expect("registry lock");
        if map.contains_key(&key) {
            return Err(Error::DuplicateComponent(format!(
                "{}/{}",
                info.kind.as_str(),
                info.name
            )));
        }
        debug!(kind = info.kind.as_str(), name = %info.name, plugin, "Component registered");
        map.insert(key, ComponentRecord { info, implementation });
        Ok(())
    }

    pub fn unregister_plugin(&self, plugin: &str) -> usize {
        let mut map = self.inner.write().expect("registry lock");
        let before = map.len();
        map.retain(|_, record| record.info.plugin != plugin);
        before - map.len()
    }

    pub fn get(&self, kind: ComponentKind, name: &str) -> Option<ComponentRecord> {
        self.inner
            .read()
            .expect("registry lock")
            .get(&(kind, name.to_string()))
            .cloned()
    }

    pub fn by_kind(&self, kind: ComponentKind) -> Vec<ComponentRecord> {
        let map = self.inner.read().expect("registry lock");
        let mut records: Vec<ComponentRecord> = map
            .values()
            .filter(|r| r.info.kind == kind && r.info.enabled)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.info.name.cmp(&b.info.name));
        records
    }

    pub fn set_enabled(&self, kind: ComponentKind, name: &str, enabled: bool) -> bool {
        let mut map = self.inner.write().expect("registry lock");
        match map.get_mut(&(kind, name.to_string())) {
            Some(record) => {
                record.info.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Command lookup by verb: plain commands first, then plus-commands.
    pub fn find_command(&self, verb: &str) -> Option<Arc<dyn CommandLike>> {
        let map = self.inner.read().expect("registry lock");
        for kind in [ComponentKind::Command, ComponentKind::PlusCommand] {
            let found = map.values().find(|r| {
                r.info.kind == kind
                    && r.info.enabled
                    && matches!(
                        &r.implementation,
                        ComponentImpl::Command(c) | ComponentImpl::PlusCommand(c) if c.verb() == verb
                    )
            });
            if let Some(record) = found {
                match &record.implementation {
                    ComponentImpl::Command(c) | ComponentImpl::PlusCommand(c) => {
                        return Some(c.clone())
                    }
                    _ => {}
                }
            }
        }
        None
    }

    pub fn actions(&self) -> Vec<(ComponentInfo, Arc<dyn ActionLike>)> {
        self.by_kind(ComponentKind::Action)
            .into_iter()
            .filter_map(|r| match r.implementation {
                ComponentImpl::Action(a) => Some((r.info, a)),
                _ => None,
            })
            .collect()
    }

    pub fn tools(&self) -> Vec<(ComponentInfo, Arc<dyn ToolLike>)> {
        self.by_kind(ComponentKind::Tool)
            .into_iter()
            .filter_map(|r| match r.implementation {
                ComponentImpl::Tool(t) => Some((r.info, t)),
                _ => None,
            })
            .collect()
    }

    pub fn interest_calculators(&self) -> Vec<(ComponentInfo, Arc<dyn InterestCalculatorLike>)> {
        self.by_kind(ComponentKind::InterestCalculator)
            .into_iter()
            .filter_map(|r| match r.implementation {
                ComponentImpl::InterestCalculator(c) => Some((r.info, c)),
                _ => None,
            })
            .collect()
    }

    pub fn prompts(&self) -> Vec<(ComponentInfo, Arc<dyn PromptLike>)> {
        self.by_kind(ComponentKind::Prompt)
            .into_iter()
            .filter_map(|r| match r.implementation {
                ComponentImpl::Prompt(p) => Some((r.info, p)),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandArgs;
    use crate::component::ComponentContext;
    use async_trait::async_trait;
    use murmur_core::{MessageEnvelope, Segment};

    struct NoopCommand {
        verb: String,
    }

    #[async_trait]
    impl CommandLike for NoopCommand {
        fn verb(&self) -> &str {
            &self.verb
        }

        async fn execute(
            &self,
            _ctx: &ComponentContext,
            _envelope: &MessageEnvelope,
            _args: &CommandArgs,
        ) -> Result<Segment> {
            Ok(Segment::text("ok"))
        }
    }

    fn command(verb: &str) -> (ComponentInfo, ComponentImpl) {
        (
            ComponentInfo::new(verb, ComponentKind::Command),
            ComponentImpl::Command(Arc::new(NoopCommand {
                verb: verb.to_string(),
            })),
        )
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ComponentRegistry::new();
        let (info, imp) = command("ping");
        registry.register("p1", info, imp).unwrap();

        assert!(registry.get(ComponentKind::Command, "ping").is_some());
        assert!(registry.find_command("ping").is_some());
        assert!(registry.find_command("pong").is_none());
        assert_eq!(registry.get(ComponentKind::Command, "ping").unwrap().info.plugin, "p1");
    }

    #[test]
    fn test_duplicate_name_within_kind_fails() {
        let registry = ComponentRegistry::new();
        let (info, imp) = command("ping");
        registry.register("p1", info, imp).unwrap();
        let (info2, imp2) = command("ping");
        assert!(matches!(
            registry.register("p2", info2, imp2),
            Err(Error::DuplicateComponent(_))
        ));
    }

    #[test]
    fn test_unregister_plugin_removes_only_its_components() {
        let registry = ComponentRegistry::new();
        let (i1, c1) = command("one");
        let (i2, c2) = command("two");
        registry.register("keep", i1, c1).unwrap();
        registry.register("drop", i2, c2).unwrap();

        assert_eq!(registry.unregister_plugin("drop"), 1);
        assert!(registry.find_command("one").is_some());
        assert!(registry.find_command("two").is_none());
    }

    #[test]
    fn test_disabled_components_hidden_from_kind_listing() {
        let registry = ComponentRegistry::new();
        let (info, imp) = command("ping");
        registry.register("p1", info, imp).unwrap();
        assert_eq!(registry.by_kind(ComponentKind::Command).len(), 1);

        assert!(registry.set_enabled(ComponentKind::Command, "ping", false));
        assert!(registry.by_kind(ComponentKind::Command).is_empty());
        assert!(registry.find_command("ping").is_none());
    }
}
