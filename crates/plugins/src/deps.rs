use async_trait::async_trait;
use murmur_core::config::DependencyConfig;
use murmur_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::plugin::PluginDependency;

/// Probes and installs declared plugin dependencies. The concrete installer
/// (system package tool, script runner) lives outside the core.
#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    /// `Some(version)` when the dependency is importable.
    async fn probe(&self, import_name: &str) -> Option<String>;

    async fn install(
        &self,
        install_name: &str,
        version_req: Option<&str>,
        proxy: Option<&str>,
        timeout: Duration,
    ) -> Result<()>;
}

/// Installer that finds nothing and installs nothing; the default when no
/// installer is wired in.
pub struct NullInstaller;

#[async_trait]
impl DependencyInstaller for NullInstaller {
    async fn probe(&self, _import_name: &str) -> Option<String> {
        None
    }

    async fn install(
        &self,
        install_name: &str,
        _version_req: Option<&str>,
        _proxy: Option<&str>,
        _timeout: Duration,
    ) -> Result<()> {
        Err(Error::PluginLoad(format!(
            "no installer configured (wanted '{}')",
            install_name
        )))
    }
}

pub struct DependencyResolver {
    policy: DependencyConfig,
    installer: Arc<dyn DependencyInstaller>,
}

impl DependencyResolver {
    pub fn new(policy: DependencyConfig, installer: Arc<dyn DependencyInstaller>) -> Self {
        Self { policy, installer }
    }

    /// Resolve every declared dependency of a plugin before `on_load`.
    /// Required-missing after resolution aborts the plugin load;
    /// optional-missing logs a warning and continues.
    pub async fn resolve(&self, plugin: &str, deps: &[PluginDependency]) -> Result<()> {
        for dep in deps {
            match self.installer.probe(&dep.import_name).await {
                Some(version) => {
                    if let Some(minimum) = &dep.version_req {
                        if !meets_minimum(&version, minimum) {
                            if dep.optional {
                                // Present-but-old optionals are treated as
                                // present; the warning keeps the signal.
                                warn!(
                                    plugin,
                                    dep = %dep.import_name,
                                    version,
                                    minimum,
                                    "Optional dependency below declared minimum"
                                );
                                continue;
                            }
                            self.try_install(plugin, dep).await?;
                        }
                    }
                }
                None if dep.optional => {
                    warn!(plugin, dep = %dep.import_name, "Optional dependency missing");
                }
                None => {
                    self.try_install(plugin, dep).await?;
                }
            }
        }
        Ok(())
    }

    async fn try_install(&self, plugin: &str, dep: &PluginDependency) -> Result<()> {
        let install_name = dep.install_name();
        if !self.policy.auto_install {
            return Err(Error::PluginLoad(format!(
                "plugin '{}' requires '{}' and auto-install is disabled",
                plugin, install_name
            )));
        }
        let allowed = self.policy.allowed_auto_install.is_empty()
            || self
                .policy
                .allowed_auto_install
                .iter()
                .any(|name| name == install_name);
        if !allowed {
            return Err(Error::PluginLoad(format!(
                "plugin '{}' requires '{}' which is not in the auto-install allowlist",
                plugin, install_name
            )));
        }

        let proxy = if self.policy.use_proxy && !self.policy.proxy_url.is_empty() {
            Some(self.policy.proxy_url.as_str())
        } else {
            None
        };
        info!(plugin, dep = install_name, "Installing missing dependency");
        self.installer
            .install(
                install_name,
                dep.version_req.as_deref(),
                proxy,
                Duration::from_secs(self.policy.auto_install_timeout),
            )
            .await
            .map_err(|e| {
                Error::PluginLoad(format!(
                    "plugin '{}': install of '{}' failed: {}",
                    plugin, install_name, e
                ))
            })?;

        match self.installer.probe(&dep.import_name).await {
            Some(_) => Ok(()),
            None => Err(Error::PluginLoad(format!(
                "plugin '{}': '{}' still missing after install",
                plugin, dep.import_name
            ))),
        }
    }
}

/// Dotted-numeric comparison; non-numeric fragments compare as zero.
fn meets_minimum(version: &str, minimum: &str) -> bool {
    let parse = |s: &str| -> Vec<u64> {
        s.trim_start_matches(['>', '=', '^', '~'])
            .split('.')
            .map(|part| {
                part.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let have = parse(version);
    let want = parse(minimum);
    for i in 0..have.len().max(want.len()) {
        let h = have.get(i).copied().unwrap_or(0);
        let w = want.get(i).copied().unwrap_or(0);
        if h != w {
            return h > w;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeInstaller {
        present: Mutex<HashMap<String, String>>,
        installable: Vec<String>,
    }

    #[async_trait]
    impl DependencyInstaller for FakeInstaller {
        async fn probe(&self, import_name: &str) -> Option<String> {
            self.present.lock().unwrap().get(import_name).cloned()
        }

        async fn install(
            &self,
            install_name: &str,
            _version_req: Option<&str>,
            _proxy: Option<&str>,
            _timeout: Duration,
        ) -> Result<()> {
            if self.installable.iter().any(|n| n == install_name) {
                self.present
                    .lock()
                    .unwrap()
                    .insert(install_name.to_string(), "1.0.0".to_string());
                Ok(())
            } else {
                Err(Error::PluginLoad(format!("cannot install {}", install_name)))
            }
        }
    }

    fn resolver(auto_install: bool, installer: FakeInstaller) -> DependencyResolver {
        DependencyResolver::new(
            DependencyConfig {
                auto_install,
                ..Default::default()
            },
            Arc::new(installer),
        )
    }

    #[test]
    fn test_meets_minimum() {
        assert!(meets_minimum("1.2.3", "1.2.0"));
        assert!(meets_minimum("2.0", ">=1.9.9"));
        assert!(!meets_minimum("1.2.3", "1.3"));
        assert!(meets_minimum("1.2.3", "1.2.3"));
    }

    #[tokio::test]
    async fn test_required_missing_without_auto_install_fails() {
        let r = resolver(
            false,
            FakeInstaller {
                present: Mutex::new(HashMap::new()),
                installable: vec![],
            },
        );
        let deps = vec![PluginDependency::required("numpy")];
        assert!(matches!(
            r.resolve("example", &deps).await,
            Err(Error::PluginLoad(_))
        ));
    }

    #[tokio::test]
    async fn test_optional_missing_is_tolerated() {
        let r = resolver(
            false,
            FakeInstaller {
                present: Mutex::new(HashMap::new()),
                installable: vec![],
            },
        );
        let deps = vec![PluginDependency::optional("pillow")];
        assert!(r.resolve("example", &deps).await.is_ok());
    }

    #[tokio::test]
    async fn test_auto_install_fills_missing_required() {
        let r = resolver(
            true,
            FakeInstaller {
                present: Mutex::new(HashMap::new()),
                installable: vec!["requests".to_string()],
            },
        );
        let deps = vec![PluginDependency::required("requests")];
        assert!(r.resolve("example", &deps).await.is_ok());
    }

    #[tokio::test]
    async fn test_allowlist_blocks_install() {
        let installer = FakeInstaller {
            present: Mutex::new(HashMap::new()),
            installable: vec!["requests".to_string()],
        };
        let r = DependencyResolver::new(
            DependencyConfig {
                auto_install: true,
                allowed_auto_install: vec!["other".to_string()],
                ..Default::default()
            },
            Arc::new(installer),
        );
        let deps = vec![PluginDependency::required("requests")];
        assert!(matches!(
            r.resolve("example", &deps).await,
            Err(Error::PluginLoad(_))
        ));
    }
}
