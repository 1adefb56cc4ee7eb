//! Configuration loading and data folder resolution

use crate::{Error, Result};
use std::path::PathBuf;

/// Data folder resolution priority order:
/// 1. Environment variable (highest priority)
/// 2. TOML config file
/// 3. OS-dependent compiled default (fallback)
pub fn resolve_data_folder(env_var_name: &str) -> PathBuf {
    // Priority 1: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        return PathBuf::from(path);
    }

    // Priority 2: TOML config file
    if let Ok(config_path) = find_config_file() {
        if let Ok(toml_content) = std::fs::read_to_string(&config_path) {
            if let Ok(config) = toml::from_str::<toml::Value>(&toml_content) {
                if let Some(data_folder) = config.get("data_folder").and_then(|v| v.as_str()) {
                    return PathBuf::from(data_folder);
                }
            }
        }
    }

    // Priority 3: OS-dependent compiled default
    get_default_data_folder()
}

/// Get default configuration file path for the platform
pub fn find_config_file() -> Result<PathBuf> {
    if cfg!(target_os = "linux") {
        // Try ~/.config/shelfmark/config.toml first, then /etc/shelfmark/config.toml
        let user_config = dirs::config_dir().map(|d| d.join("shelfmark").join("config.toml"));
        let system_config = PathBuf::from("/etc/shelfmark/config.toml");

        if let Some(path) = user_config {
            if path.exists() {
                return Ok(path);
            }
        }
        if system_config.exists() {
            return Ok(system_config);
        }
        return Err(Error::Config("No config file found".to_string()));
    }

    let config_path = dirs::config_dir()
        .map(|d| d.join("shelfmark").join("config.toml"))
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;

    if config_path.exists() {
        Ok(config_path)
    } else {
        Err(Error::Config(format!(
            "Config file not found: {:?}",
            config_path
        )))
    }
}

/// Get OS-dependent default data folder path
fn get_default_data_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/shelfmark (or /var/lib/shelfmark for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("shelfmark"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/shelfmark"))
    } else if cfg!(target_os = "macos") {
        // ~/Library/Application Support/shelfmark
        dirs::data_dir()
            .map(|d| d.join("shelfmark"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/shelfmark"))
    } else if cfg!(target_os = "windows") {
        // %LOCALAPPDATA%\shelfmark
        dirs::data_local_dir()
            .map(|d| d.join("shelfmark"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\shelfmark"))
    } else {
        PathBuf::from("./shelfmark_data")
    }
}

/// Ensure the data folder exists, creating it if missing
pub fn ensure_data_folder(path: &PathBuf) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
        tracing::info!(path = %path.display(), "Created data folder");
    }
    Ok(())
}

/// Standard User-Agent string for outbound HTTP clients
pub fn user_agent() -> String {
    format!(
        "Shelfmark/{} (https://github.com/shelfmark/shelfmark)",
        env!("CARGO_PKG_VERSION")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_takes_priority() {
        std::env::set_var("SHELFMARK_TEST_DATA_DIR", "/tmp/shelfmark-test");
        let resolved = resolve_data_folder("SHELFMARK_TEST_DATA_DIR");
        assert_eq!(resolved, PathBuf::from("/tmp/shelfmark-test"));
        std::env::remove_var("SHELFMARK_TEST_DATA_DIR");
    }

    #[test]
    fn test_default_folder_is_absolute_or_local() {
        let folder = get_default_data_folder();
        assert!(!folder.as_os_str().is_empty());
    }

    #[test]
    fn test_user_agent_contains_version() {
        assert!(user_agent().contains(env!("CARGO_PKG_VERSION")));
    }
}
