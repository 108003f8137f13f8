// Configuration for the DRM Testbed
//
// Node layout, debugfs location and tool paths. Defaults match a stock
// Linux system; a JSON file named by DRM_TESTBED_CONFIG may override any
// field and DRM_TESTBED_LOG overrides the log level.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::LevelFilter;
use serde::{Deserialize, Serialize};

use crate::error::{DrmError, Result};
use crate::gpu::ioctl::primary_minor;

/// Environment variable naming a JSON config file
pub const CONFIG_ENV: &str = "DRM_TESTBED_CONFIG";

/// Environment variable overriding `log_level`
pub const LOG_ENV: &str = "DRM_TESTBED_LOG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub legacy_dir: PathBuf,    // Directory holding legacy and render nodes
    pub legacy_prefix: String,  // card
    pub legacy_count: u32,      // Legacy nodes scanned, highest index first
    pub render_prefix: String,  // renderD
    pub render_base: u32,       // First render node index
    pub render_count: u32,      // Render nodes scanned, lowest index first
    pub debugfs_root: PathBuf,  // dri debugfs directory, one subdir per minor
    pub modprobe: PathBuf,      // Module loader for synthetic devices
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            legacy_dir: PathBuf::from("/dev/dri"),
            legacy_prefix: "card".to_string(),
            legacy_count: 3,
            render_prefix: "renderD".to_string(),
            render_base: 128,
            render_count: 16,
            debugfs_root: PathBuf::from("/sys/kernel/debug/dri"),
            modprobe: PathBuf::from("/sbin/modprobe"),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads the configuration named by the environment, or the defaults
    pub fn load() -> Result<Self> {
        let path = env::var_os(CONFIG_ENV).map(PathBuf::from);
        let log_level = env::var(LOG_ENV).ok();
        Self::load_from(path.as_deref(), log_level)
    }

    /// Loads from an optional file, then applies a log level override
    pub fn load_from(path: Option<&Path>, log_level: Option<String>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        if let Some(level) = log_level {
            config.log_level = level;
        }
        config.validate()?;
        Ok(config)
    }

    /// Parses a JSON config file; missing fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            DrmError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| DrmError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    fn validate(&self) -> Result<()> {
        if self.legacy_count == 0 && self.render_count == 0 {
            return Err(DrmError::Config("no device nodes to scan".to_string()));
        }
        self.log_filter().map(|_| ())
    }

    pub fn log_filter(&self) -> Result<LevelFilter> {
        LevelFilter::from_str(&self.log_level)
            .map_err(|_| DrmError::Config(format!("unknown log level '{}'", self.log_level)))
    }

    /// Path of legacy node `index`, e.g. /dev/dri/card0
    pub fn legacy_path(&self, index: u32) -> PathBuf {
        self.legacy_dir.join(format!("{}{}", self.legacy_prefix, index))
    }

    /// Path of the `offset`-th render node, e.g. /dev/dri/renderD128
    pub fn render_path(&self, offset: u32) -> PathBuf {
        self.legacy_dir
            .join(format!("{}{}", self.render_prefix, self.render_base + offset))
    }

    /// The dri debugfs directory of a node's card, keyed by its trailing
    /// index; render nodes map to their primary node's directory
    pub fn debugfs_dir(&self, node: &Path) -> Option<PathBuf> {
        let name = node.file_name()?.to_str()?;
        let digits = name.trim_start_matches(|c: char| !c.is_ascii_digit());
        let minor: u64 = digits.parse().ok()?;
        Some(self.debugfs_root.join(primary_minor(minor).to_string()))
    }
}
