//! Platform-aware data storage directory management
//!
//! | Type | Windows | macOS | Linux |
//! |------|---------|-------|-------|
//! | Data | `%APPDATA%\Courier\` | `~/Library/Application Support/Courier/` | `$XDG_DATA_HOME/courier/` |

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;

use super::config::AppConfig;
use super::constants::{APP_DOT_FOLDER, APP_NAME, ENV_DATA_DIR};

/// Data subdirectories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSubdir {
    Sqlite,
    Files,
    FilesTemp,
}

impl DataSubdir {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DataSubdir::Sqlite => "sqlite",
            DataSubdir::Files => "files",
            DataSubdir::FilesTemp => "files_temp",
        }
    }

    /// Subdirectories that are always created.
    /// Files and FilesTemp are created only when file storage is enabled.
    pub const fn all() -> &'static [DataSubdir] {
        &[DataSubdir::Sqlite]
    }

    /// Subdirectories for file storage (created when enabled).
    pub const fn files() -> &'static [DataSubdir] {
        &[DataSubdir::Files, DataSubdir::FilesTemp]
    }
}

/// Application storage manager
#[derive(Debug, Clone)]
pub struct AppStorage {
    data_dir: PathBuf,
}

impl AppStorage {
    /// Initialize storage with platform-appropriate data directory
    pub async fn init(config: &AppConfig) -> Result<Self> {
        let data_dir = Self::resolve_data_dir();

        Self::ensure_directories(&data_dir, config.files.enabled).await?;

        // Canonicalize after creation for clean paths in logs
        let data_dir = data_dir.canonicalize().unwrap_or(data_dir);

        tracing::debug!(data_dir = %data_dir.display(), "Storage initialized");

        if config.files.enabled {
            let files_path = data_dir.join(DataSubdir::Files.as_str());
            tracing::debug!(path = %files_path.display(), "File storage enabled");
        }

        Ok(Self { data_dir })
    }

    /// Resolve data directory from env var or platform default
    pub fn resolve_data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            return PathBuf::from(dir);
        }

        if let Some(proj_dirs) = ProjectDirs::from("", "", APP_NAME) {
            return proj_dirs.data_dir().to_path_buf();
        }

        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        cwd.join(APP_DOT_FOLDER)
    }

    async fn ensure_directories(data_dir: &Path, files_enabled: bool) -> Result<()> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        for subdir in DataSubdir::all() {
            let path = data_dir.join(subdir.as_str());
            tokio::fs::create_dir_all(&path).await.with_context(|| {
                format!(
                    "Failed to create {} directory: {}",
                    subdir.as_str(),
                    path.display()
                )
            })?;
        }

        if files_enabled {
            for subdir in DataSubdir::files() {
                let path = data_dir.join(subdir.as_str());
                tokio::fs::create_dir_all(&path).await.with_context(|| {
                    format!(
                        "Failed to create {} directory: {}",
                        subdir.as_str(),
                        path.display()
                    )
                })?;
            }
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Get path to a subdirectory (canonicalized)
    pub fn subdir(&self, subdir: DataSubdir) -> PathBuf {
        let path = self.data_dir.join(subdir.as_str());
        path.canonicalize().unwrap_or(path)
    }

    /// Create AppStorage for testing with a specific data directory
    #[cfg(test)]
    pub fn init_for_test(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_subdir_as_str() {
        assert_eq!(DataSubdir::Sqlite.as_str(), "sqlite");
        assert_eq!(DataSubdir::Files.as_str(), "files");
        assert_eq!(DataSubdir::FilesTemp.as_str(), "files_temp");
    }

    #[test]
    fn test_data_subdir_groups() {
        assert!(DataSubdir::all().contains(&DataSubdir::Sqlite));
        assert!(!DataSubdir::all().contains(&DataSubdir::Files));
        assert!(DataSubdir::files().contains(&DataSubdir::Files));
        assert!(DataSubdir::files().contains(&DataSubdir::FilesTemp));
    }

    #[tokio::test]
    async fn test_init_creates_subdirectories() {
        let temp = tempfile::tempdir().unwrap();
        // SAFETY: tests in this module do not race on this env var
        unsafe { std::env::set_var(ENV_DATA_DIR, temp.path()) };
        let config = AppConfig::default();

        let storage = AppStorage::init(&config).await.unwrap();
        assert!(storage.subdir(DataSubdir::Sqlite).exists());

        unsafe { std::env::remove_var(ENV_DATA_DIR) };
    }
}
