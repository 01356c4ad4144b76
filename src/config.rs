use anyhow::{Context, Result};
use declarative::EngineConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Get the config directory path (~/.config/converge)
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".config").join("converge"))
}

/// Get the state directory path (~/.local/state/converge)
pub fn state_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".local").join("state").join("converge"))
}

/// Contents of config.toml
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// State file; `~` is expanded
    pub state_file: Option<String>,
    /// Emulated remote snapshot; `~` is expanded
    pub remote_file: Option<String>,
    pub engine: EngineConfig,
}

impl AppConfig {
    /// Load the config at `path`, or the default location. A missing file
    /// yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => config_dir()?.join("config.toml"),
        };
        if !path.exists() {
            log::debug!("Config file {} does not exist, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        config
            .engine
            .validate()
            .with_context(|| format!("Invalid engine settings in {}", path.display()))?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Resolved state file path
    pub fn state_path(&self, flag: Option<&Path>) -> Result<PathBuf> {
        resolve(flag, self.state_file.as_deref(), "state.json")
    }

    /// Resolved emulated remote path
    pub fn remote_path(&self, flag: Option<&Path>) -> Result<PathBuf> {
        resolve(flag, self.remote_file.as_deref(), "remote.json")
    }
}

/// Command-line flag, then config value, then the state directory default
fn resolve(flag: Option<&Path>, configured: Option<&str>, default_name: &str) -> Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = configured {
        let expanded = shellexpand::tilde(path);
        return Ok(PathBuf::from(expanded.as_ref()));
    }
    Ok(state_dir()?.join(default_name))
}
