//! Well-known configuration file locations.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

use crate::error::ConfigError;

/// Project config filename, checked into the repository.
pub const PROJECT_CONFIG_FILE: &str = "covalent.toml";

/// Local override filename, conventionally gitignored.
pub const LOCAL_CONFIG_FILE: &str = "covalent.local.toml";

/// Resolver for user- and project-level configuration files.
#[derive(Debug, Default)]
pub struct Paths;

impl Paths {
    pub fn new() -> Self {
        Self
    }

    /// The user's config file (`~/.config/covalent/config.toml` on Linux).
    pub fn user_config_file(&self) -> Result<PathBuf, ConfigError> {
        let dirs =
            ProjectDirs::from("dev", "covalent", "covalent").ok_or(ConfigError::NoHomeDirectory)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// The project config file inside `project_dir`.
    pub fn project_config_file(project_dir: &Path) -> PathBuf {
        project_dir.join(PROJECT_CONFIG_FILE)
    }

    /// The gitignored local override inside `project_dir`.
    pub fn local_config_file(project_dir: &Path) -> PathBuf {
        project_dir.join(LOCAL_CONFIG_FILE)
    }
}
