//! Profile Storage
//!
//! This module handles the persistent `profiles.toml` file that names the
//! warehouses a build can target.
//!
//! ```toml
//! [profiles.analytics]
//! target = "dev"
//!
//! [profiles.analytics.outputs.dev]
//! type = "postgres"
//! threads = 4
//! host = "localhost"
//! port = 5432
//! user = "dbt"
//! password_env = "PGPASSWORD"
//! database = "analytics"
//! schema = "dbt_dev"
//! ```

use crate::config::{Credentials, Profile};
use crate::error::{RelcacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Profiles file name
const PROFILES_FILE: &str = "profiles.toml";

fn default_threads() -> usize {
    1
}

/// One output (target) of a profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Number of worker threads
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Warehouse credentials
    #[serde(flatten)]
    pub credentials: Credentials,
}

/// A named profile and its targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileEntry {
    /// Target used when none is requested
    pub target: String,
    /// Available targets
    #[serde(default)]
    pub outputs: BTreeMap<String, TargetConfig>,
}

/// Contents of `profiles.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileEntry>,
}

impl ProfilesFile {
    /// Create an empty profiles file
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the default profiles file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| RelcacheError::Config("Could not find configuration directory".to_string()))?
            .join("relcache");

        Ok(config_dir.join(PROFILES_FILE))
    }

    /// Parse profiles from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load profiles from disk
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RelcacheError::NotFound(format!(
                "profiles file {}",
                path.display()
            )));
        }

        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load profiles from the default location
    pub fn load_default() -> Result<Self> {
        Self::load(&Self::default_path()?)
    }

    /// Save profiles to disk, creating the parent directory if needed
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Add or replace one target of a profile
    pub fn set_target(
        &mut self,
        profile: &str,
        target: &str,
        threads: usize,
        credentials: Credentials,
    ) {
        let entry = self
            .profiles
            .entry(profile.to_string())
            .or_insert_with(|| ProfileEntry {
                target: target.to_string(),
                outputs: BTreeMap::new(),
            });
        entry.outputs.insert(
            target.to_string(),
            TargetConfig {
                threads,
                credentials,
            },
        );
    }

    /// List all profile names
    pub fn profile_names(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }

    /// Resolve a profile and target (the profile's default when `None`)
    pub fn resolve(&self, profile: &str, target: Option<&str>) -> Result<Profile> {
        let entry = self.profiles.get(profile).ok_or_else(|| {
            RelcacheError::NotFound(format!(
                "profile \"{}\" (available: {})",
                profile,
                self.profile_names().join(", ")
            ))
        })?;

        let target = target.unwrap_or(&entry.target);
        let output = entry.outputs.get(target).ok_or_else(|| {
            RelcacheError::NotFound(format!(
                "target \"{}\" in profile \"{}\"",
                target, profile
            ))
        })?;

        if output.threads == 0 {
            return Err(RelcacheError::Config(format!(
                "profile \"{}\" target \"{}\" must use at least one thread",
                profile, target
            )));
        }

        Ok(Profile::new(
            profile,
            target,
            output.threads,
            output.credentials.clone(),
        ))
    }
}
