//! Server configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Expand `${VAR_NAME}` environment references in a config file.
fn expand_env_vars(input: &str) -> String {
  let mut result = input.to_string();
  while let Some(start) = result.find("${") {
    let Some(end) = result[start..].find('}') else {
      break;
    };
    let var_name = &result[start + 2..start + end];
    let value = std::env::var(var_name).unwrap_or_default();
    result = format!("{}{}{}", &result[..start], value, &result[start + end + 1..]);
  }
  result
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
  #[serde(default)]
  pub server: ServerSection,
  #[serde(default)]
  pub cache: CacheSection,
  #[serde(default)]
  pub logging: LoggingSection,
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
  #[serde(default = "default_host")]
  pub host: String,
  #[serde(default = "default_port")]
  pub port: u16,
}

fn default_host() -> String {
  "0.0.0.0".into()
}

fn default_port() -> u16 {
  7170
}

impl Default for ServerSection {
  fn default() -> Self {
    Self {
      host: default_host(),
      port: default_port(),
    }
  }
}

/// Cache behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
  /// Memory ceiling in megabytes.
  #[serde(default = "default_size_mb")]
  pub size_mb: u64,

  /// Fraction of the ceiling at which eviction is signaled, in (0, 1].
  #[serde(default = "default_eviction_threshold")]
  pub eviction_threshold: f64,

  /// Fraction of live entries removed per eviction pass, in (0, 1].
  #[serde(default = "default_eviction_factor")]
  pub eviction_factor: f64,

  /// True: the sweep deletes due entries. False: due entries are flagged
  /// and removed on their next read.
  #[serde(default = "default_strict_expiry")]
  pub strict_expiry: bool,

  /// Seconds between expiry sweeps.
  #[serde(default = "default_sweep_interval")]
  pub sweep_interval: u64,
}

fn default_size_mb() -> u64 {
  64
}

fn default_eviction_threshold() -> f64 {
  0.9
}

fn default_eviction_factor() -> f64 {
  0.75
}

fn default_strict_expiry() -> bool {
  true
}

fn default_sweep_interval() -> u64 {
  6
}

impl Default for CacheSection {
  fn default() -> Self {
    Self {
      size_mb: default_size_mb(),
      eviction_threshold: default_eviction_threshold(),
      eviction_factor: default_eviction_factor(),
      strict_expiry: default_strict_expiry(),
      sweep_interval: default_sweep_interval(),
    }
  }
}

impl CacheSection {
  /// Ceiling in bytes.
  pub fn ceiling_bytes(&self) -> u64 {
    self.size_mb * 1_048_576
  }

  pub fn validate(&self) -> Result<(), anyhow::Error> {
    if self.size_mb == 0 {
      anyhow::bail!("cache.size_mb must be positive");
    }
    for (name, value) in [
      ("cache.eviction_threshold", self.eviction_threshold),
      ("cache.eviction_factor", self.eviction_factor),
    ] {
      if !(value > 0.0 && value <= 1.0) {
        anyhow::bail!("{} must be in (0, 1], got {}", name, value);
      }
    }
    if self.sweep_interval == 0 {
      anyhow::bail!("cache.sweep_interval must be positive");
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
  #[serde(default = "default_level")]
  pub level: String,
}

fn default_level() -> String {
  "info".into()
}

impl Default for LoggingSection {
  fn default() -> Self {
    Self {
      level: default_level(),
    }
  }
}

impl ServerConfig {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
    let content = std::fs::read_to_string(&path)?;
    let expanded = expand_env_vars(&content);
    Ok(serde_yaml::from_str(&expanded)?)
  }

  pub fn find_and_load() -> Result<Option<Self>, anyhow::Error> {
    for p in ["acorncache.yaml", "acorncache.yml"] {
      if Path::new(p).exists() {
        tracing::info!("Loading config from {}", p);
        return Ok(Some(Self::from_file(p)?));
      }
    }
    Ok(None)
  }

  pub fn address(&self) -> String {
    format!("{}:{}", self.server.host, self.server.port)
  }
}
