use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "VLOOM_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub budget: BudgetConfig,
    pub generation: GenerationConfig,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BudgetConfig {
    /// Ceiling for resident model/adapter weights, in MiB.
    pub device_memory_mb: u64,
    /// Largest spatial tile edge used by tiled encode/decode. 0 disables tiling.
    pub max_tile_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    pub window_size: usize,
    pub window_overlap: usize,
    pub steps: usize,
    pub guidance: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    /// CPU workers for conditioning-input preprocessing. These never touch
    /// device residency.
    pub preprocess_workers: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            budget: BudgetConfig::default(),
            generation: GenerationConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            output_dir: PathBuf::from("output"),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            device_memory_mb: 8192,
            max_tile_size: 256,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            window_size: 81,
            window_overlap: 16,
            steps: 30,
            guidance: 5.0,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            preprocess_workers: 2,
        }
    }
}

impl BudgetConfig {
    pub fn budget_bytes(&self) -> u64 {
        self.device_memory_mb * 1024 * 1024
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. VLOOM_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Initialize the data directory structure on first run:
/// - Creates data_dir if missing
/// - Writes default config.toml only if file doesn't exist
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        let default_cfg = AppConfig::default();
        default_cfg.save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Resolve a path relative to a base directory.
/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Parse a custom resolution list file: one `WIDTHxHEIGHT` per line,
/// `#` comments and blank lines ignored.
pub fn load_resolution_list(path: &Path) -> Result<Vec<(u32, u32)>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read resolution list: {}", path.display()))?;

    let mut resolutions = Vec::new();
    for (line_no, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((w, h)) = line.split_once('x') else {
            bail!(
                "invalid resolution '{line}' at {}:{} (expected WIDTHxHEIGHT)",
                path.display(),
                line_no + 1
            );
        };

        let width: u32 = w.trim().parse().with_context(|| {
            format!("invalid width '{w}' at {}:{}", path.display(), line_no + 1)
        })?;
        let height: u32 = h.trim().parse().with_context(|| {
            format!("invalid height '{h}' at {}:{}", path.display(), line_no + 1)
        })?;
        resolutions.push((width, height));
    }

    Ok(resolutions)
}
