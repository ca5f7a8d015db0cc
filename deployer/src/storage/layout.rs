//! Storage layout configuration

use std::path::PathBuf;

use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Directory name of the cloned installer repository
pub const REPOSITORY_DIR_NAME: &str = "euler-copilot-framework";

/// Storage layout for the deployer
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Directory the installer repository is cloned into
    pub fn deployment_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("deployment").join(REPOSITORY_DIR_NAME))
    }

    /// Installer scripts inside the repository
    pub fn scripts_dir(&self) -> Dir {
        self.deployment_dir().subdir("deploy").subdir("scripts")
    }

    /// Helm values file templated with the model endpoints
    pub fn values_file(&self) -> File {
        File::new(
            self.deployment_dir()
                .path()
                .join("deploy/chart/euler_copilot/values.yaml"),
        )
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), crate::errors::DeployError> {
        Dir::new(self.base_dir.join("deployment")).create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        let base_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("stackdeploy");

        Self::new(base_dir)
    }
}

// Minimal per-user cache dir lookup
mod dirs {
    use std::path::PathBuf;

    pub fn cache_dir() -> Option<PathBuf> {
        if let Some(xdg) = std::env::var_os("XDG_CACHE_HOME").filter(|v| !v.is_empty()) {
            return Some(PathBuf::from(xdg));
        }
        let home = std::env::var_os("HOME").map(PathBuf::from)?;

        #[cfg(target_os = "macos")]
        return Some(home.join("Library").join("Caches"));

        #[cfg(not(target_os = "macos"))]
        Some(home.join(".cache"))
    }
}
