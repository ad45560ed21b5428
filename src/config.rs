//! Optional TOML defaults
//!
//! A config file supplies default filter lists beneath the command line:
//!
//! ```toml
//! [filters]
//! ignore_processes = ["mdworker_shared", "Spotlight"]
//! ignore_prefixes = ["/System", "/private/var/db"]
//! max_depth = 4
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;

use crate::constants::APP_NAME;
use crate::models::Filters;

/// Top-level config file layout
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub filters: FilterSettings,
}

/// `[filters]` table
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterSettings {
    pub allow_processes: Vec<String>,
    pub ignore_processes: Vec<String>,
    pub ignore_prefixes: Vec<String>,
    pub max_depth: Option<i64>,
}

impl FileConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid config file")
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// `<config dir>/fs-tracer/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join("config.toml"))
    }

    /// Load an explicit file, else the default file if it exists, else nothing
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => {
                debug!("loading config from {}", path.display());
                Self::load_from_file(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Layer command-line filters on top of the file defaults
    ///
    /// Lists are concatenated file-first. A depth given on the command line
    /// replaces the file's depth. Negative depths mean unlimited.
    pub fn merge_filters(&self, cli: Filters, cli_max_depth: Option<i64>) -> Filters {
        let settings = &self.filters;
        let concat = |base: &[String], extra: Vec<String>| -> Vec<String> {
            base.iter().cloned().chain(extra).collect()
        };

        Filters {
            allow_processes: concat(&settings.allow_processes, cli.allow_processes),
            ignore_processes: concat(&settings.ignore_processes, cli.ignore_processes),
            ignore_prefixes: concat(&settings.ignore_prefixes, cli.ignore_prefixes),
            max_depth: cli_max_depth.or(settings.max_depth).map_or(0, depth_limit),
            raw: cli.raw,
        }
    }
}

/// Component limit for a requested depth, `0` for anything not positive
pub fn depth_limit(requested: i64) -> usize {
    usize::try_from(requested).unwrap_or(0)
}
