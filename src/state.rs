//! On-disk state: the recorded live resources and the emulated remote

use anyhow::{Context, Result};
use declarative::StateStore;
use declarative::transport::memory::{MemorySnapshot, MemoryTransport};
use std::fs;
use std::path::{Path, PathBuf};

/// Open the state store at `path`, creating nothing until the first write
pub fn open_store(path: &Path) -> Result<StateStore> {
    StateStore::open(path).with_context(|| format!("Failed to open state file: {}", path.display()))
}

/// Emulated remote persisted as a JSON snapshot
#[derive(Debug)]
pub struct RemoteFile {
    path: PathBuf,
}

impl RemoteFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot into `transport`; a missing file leaves it empty
    pub fn load_into(&self, transport: &MemoryTransport) -> Result<()> {
        if !self.path.exists() {
            log::debug!("Remote snapshot does not exist, starting empty");
            return Ok(());
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read remote snapshot: {}", self.path.display()))?;
        let snapshot: MemorySnapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse remote snapshot: {}", self.path.display()))?;

        log::debug!(
            "Loaded {} remote resource(s) from {}",
            snapshot.resources.len(),
            self.path.display()
        );
        transport.restore(snapshot);
        Ok(())
    }

    /// Save the current contents of `transport`
    pub fn save(&self, transport: &MemoryTransport) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }

        let content = serde_json::to_string_pretty(&transport.snapshot())
            .context("Failed to serialize remote snapshot")?;
        fs::write(&self.path, content)
            .with_context(|| format!("Failed to write remote snapshot: {}", self.path.display()))?;

        log::debug!("Saved remote snapshot to {}", self.path.display());
        Ok(())
    }
}
