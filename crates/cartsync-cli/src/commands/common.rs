use std::path::{Path, PathBuf};

use cartsync_core::{SqliteLocalStore, SyncSettings};

use crate::error::CliError;

/// Settings from the config file (if any) with environment overrides applied
pub fn load_settings(config_path: Option<&Path>) -> Result<SyncSettings, CliError> {
    let path = config_path.map_or_else(default_config_path, Path::to_path_buf);
    Ok(SyncSettings::load(path)?.apply_env_overrides()?)
}

/// `--db-path` wins over the settings, which win over the data directory
pub fn resolve_db_path(cli_db_path: Option<PathBuf>, settings: &SyncSettings) -> PathBuf {
    cli_db_path
        .or_else(|| settings.database_path.clone())
        .unwrap_or_else(default_db_path)
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cartsync")
        .join("settings.json")
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cartsync")
        .join("cartsync.db")
}

pub fn open_store(path: &Path) -> Result<SqliteLocalStore, CliError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(SqliteLocalStore::open(path)?)
}

pub fn require_name(name: &str) -> Result<String, CliError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CliError::EmptyName);
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn cli_path_wins_over_settings() {
        let settings = SyncSettings {
            database_path: Some(PathBuf::from("/from/settings.db")),
            ..SyncSettings::default()
        };
        assert_eq!(
            resolve_db_path(Some(PathBuf::from("/from/cli.db")), &settings),
            PathBuf::from("/from/cli.db")
        );
        assert_eq!(
            resolve_db_path(None, &settings),
            PathBuf::from("/from/settings.db")
        );
        assert!(resolve_db_path(None, &SyncSettings::default()).ends_with("cartsync/cartsync.db"));
    }

    #[test]
    fn open_store_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cartsync.db");
        open_store(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn blank_names_are_rejected() {
        assert!(matches!(require_name("  "), Err(CliError::EmptyName)));
        assert_eq!(require_name(" Milk ").unwrap(), "Milk");
    }
}
