use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use luau_bridge::OptLevel;
use luau_bridge_stdlib::{KvStore, StdlibConfig};
use serde::Deserialize;

/// File picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "lbridge.toml";

/// Settings read from `lbridge.toml`. Command-line flags override them.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CliConfig {
    /// Directory `require` resolves modules against.
    pub libs_dir: Option<PathBuf>,
    /// Compiler optimization level, 0 to 2.
    pub opt_level: Option<i32>,
    /// Globals removed after the standard libraries are opened.
    pub sandbox: Vec<String>,
    /// Initial contents of the `kv` store.
    pub kv_seed: Option<serde_json::Value>,
}

impl CliConfig {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: CliConfig = toml::from_str(text)?;
        if let Some(level) = config.opt_level
            && OptLevel::from_level(level).is_none()
        {
            anyhow::bail!("opt_level must be 0, 1 or 2 (got {})", level);
        }
        Ok(config)
    }

    /// Read `explicit` when given, else `lbridge.toml` in `dir` if present.
    /// Relative `libs_dir` entries resolve against the file's directory.
    pub fn load(explicit: Option<&Path>, dir: &Path) -> anyhow::Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let candidate = dir.join(DEFAULT_CONFIG_FILE);
                if !candidate.is_file() {
                    return Ok(Self::default());
                }
                candidate
            }
        };
        let text =
            std::fs::read_to_string(&path).with_context(|| format!("Failed to read config '{}'", path.display()))?;
        let mut config = Self::parse(&text).with_context(|| format!("Invalid config '{}'", path.display()))?;
        if let Some(libs) = &config.libs_dir
            && libs.is_relative()
        {
            let base = path.parent().unwrap_or(Path::new("."));
            config.libs_dir = Some(base.join(libs));
        }
        Ok(config)
    }
}

/// Effective settings for one invocation.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub libs_dir: Option<PathBuf>,
    pub opt_level: OptLevel,
    pub sandbox: Vec<String>,
    pub kv_seed: Option<serde_json::Value>,
    pub async_mode: bool,
}

impl Settings {
    /// Merge file settings with flags; flags win.
    pub fn resolve(config: CliConfig, libs_dir: Option<PathBuf>, opt_level: Option<i32>) -> anyhow::Result<Self> {
        let level = opt_level.or(config.opt_level).unwrap_or(OptLevel::default() as i32);
        let opt_level = OptLevel::from_level(level)
            .ok_or_else(|| anyhow::anyhow!("optimization level must be 0, 1 or 2 (got {})", level))?;
        Ok(Self {
            libs_dir: libs_dir.or(config.libs_dir),
            opt_level,
            sandbox: config.sandbox,
            kv_seed: config.kv_seed,
            async_mode: false,
        })
    }

    pub fn stdlib_config(&self) -> StdlibConfig {
        let kv = match &self.kv_seed {
            Some(seed) => KvStore::with_seed(seed.clone()),
            None => KvStore::new(),
        };
        StdlibConfig {
            libs_dir: self.libs_dir.clone(),
            opt_level: self.opt_level,
            async_yield: self.async_mode,
            kv: Arc::new(kv),
        }
    }
}
