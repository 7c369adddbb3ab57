//! Layered configuration loading.
//!
//! Loads and merges configuration from two locations:
//! 1. Global: `~/.config/conntrack/conntrack.toml`
//! 2. Project: `<workspace>/.conntrack/conntrack.toml`
//!
//! Project values take precedence for every field they set.

use crate::{ConntrackConfig, SettingsError};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "conntrack.toml";

/// Loads and merges `ConntrackConfig` from global and project-level files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the merged configuration for the given workspace.
    ///
    /// Missing files are skipped.
    ///
    /// # Errors
    /// Returns the first read or parse error from a file that exists.
    pub fn load(workspace: &Path) -> Result<ConntrackConfig, SettingsError> {
        let global = match Self::global_config_path() {
            Some(path) => Self::load_optional(&path)?,
            None => ConntrackConfig::default(),
        };
        let project = Self::load_optional(&Self::project_config_path(workspace))?;
        Ok(global.merge(project))
    }

    /// Path to the global config file, if a config directory is known.
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("conntrack").join(CONFIG_FILE))
    }

    /// Path to the project config file for the given workspace.
    pub fn project_config_path(workspace: &Path) -> PathBuf {
        workspace.join(".conntrack").join(CONFIG_FILE)
    }

    fn load_optional(path: &Path) -> Result<ConntrackConfig, SettingsError> {
        if !path.exists() {
            return Ok(ConntrackConfig::default());
        }
        ConntrackConfig::load(path)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_project_config_path() {
        let path = ConfigLoader::project_config_path(Path::new("/workspace"));
        assert_eq!(path, PathBuf::from("/workspace/.conntrack/conntrack.toml"));
    }

    #[test]
    fn test_global_config_path_ends_with_file_name() {
        if let Some(path) = ConfigLoader::global_config_path() {
            assert!(path.ends_with("conntrack/conntrack.toml"));
        }
    }

    #[test]
    fn test_load_optional_missing_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::load_optional(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, ConntrackConfig::default());
    }

    #[test]
    fn test_load_project_config() {
        let dir = tempfile::tempdir().unwrap();
        let project_dir = dir.path().join(".conntrack");
        fs::create_dir_all(&project_dir).unwrap();
        fs::write(
            project_dir.join("conntrack.toml"),
            "[relay]\nupstream = \"127.0.0.1:9999\"\n",
        )
        .unwrap();

        let config = ConfigLoader::load_optional(&ConfigLoader::project_config_path(dir.path()))
            .unwrap();
        assert_eq!(config.relay.upstream.as_deref(), Some("127.0.0.1:9999"));
    }

    #[test]
    fn test_load_malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let project_dir = dir.path().join(".conntrack");
        fs::create_dir_all(&project_dir).unwrap();
        fs::write(project_dir.join("conntrack.toml"), "not valid toml :::").unwrap();

        let result = ConfigLoader::load_optional(&ConfigLoader::project_config_path(dir.path()));
        assert!(matches!(result, Err(SettingsError::ParseError(_))));
    }
}
