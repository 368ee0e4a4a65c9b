use murmur_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, warn};

/// One JSON staging file. The memory staging layers write through here when
/// their primary persistence fails, and replay the contents on startup.
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        match serde_json::from_str(&content) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                // A corrupt journal must not block startup; stash it aside.
                warn!(path = %self.path.display(), error = %e, "Journal unreadable, renaming to .corrupt");
                let _ = std::fs::rename(&self.path, self.path.with_extension("json.corrupt"));
                Ok(None)
            }
        }
    }

    /// Write via temp-file-then-rename so a crash mid-write never truncates
    /// the previous good snapshot.
    pub fn save<T: Serialize>(&self, value: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(value)?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| Error::Storage(format!("Journal rename failed: {}", e)))?;
        debug!(path = %self.path.display(), "Journal written");
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
