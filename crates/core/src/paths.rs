use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".murmur"))
            .unwrap_or_else(|| PathBuf::from(".murmur"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.yaml")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base.join("data")
    }

    pub fn db_file(&self) -> PathBuf {
        self.data_dir().join("murmur.db")
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.data_dir().join("staging")
    }

    pub fn perceptual_journal(&self) -> PathBuf {
        self.journal_dir().join("perceptual.json")
    }

    pub fn short_term_journal(&self) -> PathBuf {
        self.journal_dir().join("short_term.json")
    }

    pub fn promotion_queue_journal(&self) -> PathBuf {
        self.journal_dir().join("promotion_queue.json")
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.base.join("plugins")
    }

    pub fn plugin_config_dir(&self) -> PathBuf {
        self.base.join("plugin_config")
    }

    pub fn plugin_config_file(&self, plugin: &str) -> PathBuf {
        let safe = plugin.replace(['/', '\\', ':'], "_");
        self.plugin_config_dir().join(format!("{}.yaml", safe))
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.data_dir())?;
        std::fs::create_dir_all(self.journal_dir())?;
        std::fs::create_dir_all(self.plugins_dir())?;
        std::fs::create_dir_all(self.plugin_config_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
