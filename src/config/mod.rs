//! Parser and marker configuration
//!
//! Loaded from `heapgraph.toml` (or `.heapgraphrc.json`) next to the dump.
//!
//! ```toml
//! strictness = "warn"          # stop | warn | permissive
//! dump_index = 1               # select one dump of a multi-dump file
//! write_threads_report = true
//!
//! [marker]
//! threads = 4
//! locality = true
//! memory_budget_mb = 2048
//! ```
//!
//! `HEAPGRAPH_STRICTNESS` overrides the file value.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};

/// Environment variable overriding the configured strictness
pub const STRICTNESS_ENV: &str = "HEAPGRAPH_STRICTNESS";

/// How recoverable format violations are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    /// Abort the build with a descriptive error
    #[default]
    Stop,
    /// Log a warning and continue with the best available interpretation
    Warn,
    /// Like `Warn`, also taking liberties such as guessing overflowed lengths
    Permissive,
}

impl Strictness {
    pub fn is_stop(self) -> bool {
        self == Strictness::Stop
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Strictness::Stop => "stop",
            Strictness::Warn => "warn",
            Strictness::Permissive => "permissive",
        }
    }
}

impl fmt::Display for Strictness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strictness {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stop" => Ok(Strictness::Stop),
            "warn" | "warning" => Ok(Strictness::Warn),
            "permissive" => Ok(Strictness::Permissive),
            other => Err(format!(
                "invalid strictness '{}': expected stop, warn or permissive",
                other
            )),
        }
    }
}

/// Reachability marker settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerConfig {
    /// Worker threads; 0 or 1 runs single-threaded. Defaults to available parallelism.
    #[serde(default)]
    pub threads: Option<usize>,

    /// Use locality windows for large disk-backed graphs
    #[serde(default)]
    pub locality: bool,

    /// Memory budget used to size locality windows; defaults to available system memory
    #[serde(default)]
    pub memory_budget_mb: Option<u64>,
}

impl MarkerConfig {
    pub fn effective_threads(&self) -> usize {
        self.threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

/// Configuration for building a heap index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParserConfig {
    #[serde(default)]
    pub strictness: Strictness,

    /// Dump to index in a multi-dump file
    #[serde(default)]
    pub dump_index: Option<usize>,

    /// Write the `<prefix>threads` stack report
    #[serde(default = "default_write_threads_report")]
    pub write_threads_report: bool,

    #[serde(default)]
    pub marker: MarkerConfig,
}

fn default_write_threads_report() -> bool {
    true
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            strictness: Strictness::default(),
            dump_index: None,
            write_threads_report: default_write_threads_report(),
            marker: MarkerConfig::default(),
        }
    }
}

impl ParserConfig {
    pub fn with_strictness(mut self, strictness: Strictness) -> Self {
        self.strictness = strictness;
        self
    }

    pub fn with_dump_index(mut self, dump_index: Option<usize>) -> Self {
        self.dump_index = dump_index;
        self
    }

    /// Apply `HEAPGRAPH_STRICTNESS` if set. Invalid values are logged and ignored.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var(STRICTNESS_ENV) {
            self.apply_strictness_override(&value);
        }
    }

    fn apply_strictness_override(&mut self, value: &str) {
        match value.parse::<Strictness>() {
            Ok(strictness) => {
                debug!("{} overrides strictness to {}", STRICTNESS_ENV, strictness);
                self.strictness = strictness;
            }
            Err(e) => warn!("Ignoring {}: {}", STRICTNESS_ENV, e),
        }
    }
}

/// Load configuration from `dir`, then apply environment overrides.
///
/// Searches `heapgraph.toml`, then `.heapgraphrc.json`. Returns defaults when
/// neither exists or fails to parse.
pub fn load_config(dir: &Path) -> ParserConfig {
    let mut config = load_file_config(dir).unwrap_or_default();
    config.apply_env();
    config
}

fn load_file_config(dir: &Path) -> Option<ParserConfig> {
    let toml_path = dir.join("heapgraph.toml");
    if toml_path.exists() {
        match load_toml_config(&toml_path) {
            Ok(config) => {
                debug!("Loaded config from {}", toml_path.display());
                return Some(config);
            }
            Err(e) => warn!("Failed to load {}: {}", toml_path.display(), e),
        }
    }

    let json_path = dir.join(".heapgraphrc.json");
    if json_path.exists() {
        match load_json_config(&json_path) {
            Ok(config) => {
                debug!("Loaded config from {}", json_path.display());
                return Some(config);
            }
            Err(e) => warn!("Failed to load {}: {}", json_path.display(), e),
        }
    }

    debug!("No heapgraph config found in {}, using defaults", dir.display());
    None
}

fn load_toml_config(path: &Path) -> anyhow::Result<ParserConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: ParserConfig = toml::from_str(&content)?;
    Ok(config)
}

fn load_json_config(path: &Path) -> anyhow::Result<ParserConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: ParserConfig = serde_json::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = ParserConfig::default();
        assert_eq!(config.strictness, Strictness::Stop);
        assert!(config.dump_index.is_none());
        assert!(config.write_threads_report);
        assert!(!config.marker.locality);
    }

    #[test]
    fn test_parse_toml() {
        let config: ParserConfig = toml::from_str(
            r#"
strictness = "permissive"
dump_index = 2

[marker]
threads = 8
locality = true
"#,
        )
        .expect("parse toml");
        assert_eq!(config.strictness, Strictness::Permissive);
        assert_eq!(config.dump_index, Some(2));
        assert!(config.write_threads_report);
        assert_eq!(config.marker.threads, Some(8));
        assert_eq!(config.marker.effective_threads(), 8);
        assert!(config.marker.locality);
    }

    #[test]
    fn test_load_from_dir() {
        let dir = tempdir().expect("create temp dir");
        std::fs::write(
            dir.path().join("heapgraph.toml"),
            "strictness = \"warn\"\nwrite_threads_report = false\n",
        )
        .expect("write config");
        let config = load_file_config(dir.path()).expect("config present");
        assert_eq!(config.strictness, Strictness::Warn);
        assert!(!config.write_threads_report);
    }

    #[test]
    fn test_invalid_file_falls_back_to_defaults() {
        let dir = tempdir().expect("create temp dir");
        std::fs::write(dir.path().join("heapgraph.toml"), "strictness = 7").expect("write config");
        assert!(load_file_config(dir.path()).is_none());
    }

    #[test]
    fn test_strictness_override() {
        let mut config = ParserConfig::default();
        config.apply_strictness_override("Permissive");
        assert_eq!(config.strictness, Strictness::Permissive);
        config.apply_strictness_override("bogus");
        assert_eq!(config.strictness, Strictness::Permissive);
    }

    #[test]
    fn test_strictness_from_str() {
        assert_eq!("warn".parse::<Strictness>(), Ok(Strictness::Warn));
        assert!("lenient".parse::<Strictness>().is_err());
    }
}
