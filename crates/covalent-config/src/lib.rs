//! # covalent-config: Configuration management
//!
//! Merges configuration from built-in defaults, the user's config file
//! (`~/.config/covalent/config.toml`), the project file (`covalent.toml`),
//! a gitignored local override (`covalent.local.toml`) and `COVALENT_*`
//! environment variables, in that precedence order.

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which backend substrate the engine runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process, single-node backend.
    #[default]
    Local,
    /// Externally provided clustered backend.
    Cluster,
}

/// Top-level Covalent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CovalentConfig {
    /// Backend substrate; production deployments configure this
    /// explicitly.
    pub backend: BackendKind,

    /// Worker pool size. Unset means one thread per CPU, owned by the
    /// engine.
    pub executor_threads: Option<usize>,

    /// Filesystem path for backends that persist state.
    pub data_dir: Option<PathBuf>,
}

impl CovalentConfig {
    /// Resolves relative paths against the project directory.
    pub(crate) fn resolve_paths(&mut self, project_dir: &std::path::Path) {
        if let Some(data_dir) = &self.data_dir {
            if data_dir.is_relative() {
                self.data_dir = Some(project_dir.join(data_dir));
            }
        }
    }
}
