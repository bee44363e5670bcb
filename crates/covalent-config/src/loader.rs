//! Layered loading of [`CovalentConfig`] from files and environment.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::{CovalentConfig, Paths};

/// Builder-style loader; configure the project directory and prefix,
/// then call [`ConfigLoader::load`].
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    /// Creates a loader rooted at the current directory.
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "COVALENT".to_string(),
        }
    }

    /// Points the loader at a different project directory.
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Overrides the `COVALENT` environment-variable prefix.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Loads configuration, layering every source over the built-in
    /// defaults. Later sources win: user file, then `covalent.toml`, then
    /// `covalent.local.toml`, then environment overrides.
    pub fn load(self) -> Result<CovalentConfig> {
        let defaults = config::Config::try_from(&CovalentConfig::default())?;

        // TOML files in ascending precedence. The user-level file drops
        // out entirely on systems without a home directory.
        let candidates = Paths::new().user_config_file().ok().into_iter().chain([
            Paths::project_config_file(&self.project_dir),
            Paths::local_config_file(&self.project_dir),
        ]);

        let mut builder = config::Config::builder().add_source(defaults);
        for file in candidates.filter(|file| file.exists()) {
            builder = builder.add_source(
                config::File::from(file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .separator("_")
                .try_parsing(true),
        );

        let mut loaded: CovalentConfig = builder
            .build()
            .and_then(|merged| merged.try_deserialize())
            .with_context(|| {
                format!(
                    "configuration sources under {} did not merge into a valid config",
                    self.project_dir.display()
                )
            })?;
        loaded.resolve_paths(&self.project_dir);
        Ok(loaded)
    }

    /// Loads configuration or falls back to defaults.
    pub fn load_or_default(self) -> CovalentConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
