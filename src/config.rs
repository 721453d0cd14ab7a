use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::host::ScriptSource;
use crate::update::UpdateOptions;
use crate::worker::{ActivationPolicy, WorkerScript, CORE_ASSETS, DEFAULT_CACHE_NAME, OFFLINE_DOCUMENT};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Scope the worker is registered under; asset paths resolve against it
  pub origin: Url,
  #[serde(default)]
  pub worker: WorkerConfig,
  #[serde(default)]
  pub update: UpdateConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// Cache generation name; bump it to ship a new version
  pub cache_name: String,
  pub assets: Vec<String>,
  pub offline_document: String,
  /// Activate new versions as soon as they install (no update banner)
  pub auto_activate_on_install: bool,
  /// Upper bound for each network fetch. Unbounded when unset.
  pub fetch_timeout_secs: Option<u64>,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      cache_name: DEFAULT_CACHE_NAME.to_string(),
      assets: CORE_ASSETS.iter().map(|s| s.to_string()).collect(),
      offline_document: OFFLINE_DOCUMENT.to_string(),
      auto_activate_on_install: false,
      fetch_timeout_secs: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
  /// Delay after load before the banner is re-derived
  pub sanity_recheck_ms: u64,
  pub check_for_update_on_cutover: bool,
}

impl Default for UpdateConfig {
  fn default() -> Self {
    Self {
      sanity_recheck_ms: 300,
      check_for_update_on_cutover: true,
    }
  }
}

impl WorkerConfig {
  pub fn script(&self) -> WorkerScript {
    WorkerScript {
      cache_name: self.cache_name.clone(),
      assets: self.assets.clone(),
      offline_document: self.offline_document.clone(),
      activation: if self.auto_activate_on_install {
        ActivationPolicy::OnInstall
      } else {
        ActivationPolicy::Deferred
      },
    }
  }

  pub fn fetch_timeout(&self) -> Option<Duration> {
    self.fetch_timeout_secs.map(Duration::from_secs)
  }
}

impl UpdateConfig {
  pub fn options(&self) -> UpdateOptions {
    UpdateOptions {
      sanity_recheck: Duration::from_millis(self.sanity_recheck_ms),
      check_for_update_on_cutover: self.check_for_update_on_cutover,
    }
  }
}

impl Config {
  /// Resolve which config file to read.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./clozeshell.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/clozeshell/config.yaml
  pub fn locate(explicit_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = explicit_path {
      if p.exists() {
        return Ok(p.to_path_buf());
      }
      return Err(eyre!("Config file not found: {}", p.display()));
    }

    Self::find_config_file().ok_or_else(|| {
      eyre!(
        "No configuration file found. Create one at ~/.config/clozeshell/config.yaml\n\
                 See clozeshell.example.yaml for the format."
      )
    })
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("clozeshell.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("clozeshell").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  pub fn from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }
}

/// Update checks re-read the config file, the way a browser re-fetches the
/// worker script.
pub struct ConfigScriptSource {
  path: PathBuf,
}

impl ConfigScriptSource {
  pub fn new(path: PathBuf) -> Self {
    Self { path }
  }
}

impl ScriptSource for ConfigScriptSource {
  fn load(&self) -> Result<WorkerScript> {
    Ok(Config::from_path(&self.path)?.worker.script())
  }
}
