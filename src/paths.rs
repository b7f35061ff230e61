//! Path resolution for sshharness
//!
//! Follows the XDG Base Directory layout with env var overrides.
//!
//! ```text
//! ~/.config/sshharness/        (XDG_CONFIG_HOME)
//! └── harness.toml
//! ```
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `SSHHARNESS_CONFIG` | Config file | `~/.config/sshharness/harness.toml` |

use std::path::{Path, PathBuf};

use crate::error::{HarnessError, Result};

/// Get the XDG config directory for sshharness
///
/// Priority: `XDG_CONFIG_HOME` > `~/.config`
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("sshharness");
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".config/sshharness");
    }

    PathBuf::from(".")
}

/// Get the config file path
///
/// Priority: `SSHHARNESS_CONFIG` env var > `config_dir()/harness.toml`
pub fn config_path() -> PathBuf {
    std::env::var("SSHHARNESS_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| config_dir().join("harness.toml"))
}

/// Default private key used for key-file authentication
pub fn default_key_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".ssh/id_ed25519"))
        .unwrap_or_else(|| PathBuf::from("~/.ssh/id_ed25519"))
}

/// Expand a leading `~/` to the home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Working directory that `{cwd}` in task commands expands to
pub fn working_dir() -> Result<PathBuf> {
    std::env::current_dir().map_err(|source| HarnessError::Io {
        path: PathBuf::from("."),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Serializes tests that modify env vars
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_path_env_vars() {
        env::remove_var("SSHHARNESS_CONFIG");
        env::remove_var("XDG_CONFIG_HOME");
    }

    #[test]
    fn test_env_var_override_config() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_path_env_vars();
        env::set_var("SSHHARNESS_CONFIG", "/custom/harness.toml");
        assert_eq!(config_path(), PathBuf::from("/custom/harness.toml"));
        clear_path_env_vars();
    }

    #[test]
    fn test_xdg_config_home_override() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_path_env_vars();
        env::set_var("XDG_CONFIG_HOME", "/xdg/config");
        assert_eq!(config_dir(), PathBuf::from("/xdg/config/sshharness"));
        assert_eq!(
            config_path(),
            PathBuf::from("/xdg/config/sshharness/harness.toml")
        );
        clear_path_env_vars();
    }

    #[test]
    fn test_expand_tilde_leaves_absolute_paths() {
        assert_eq!(
            expand_tilde(Path::new("/etc/ssh/key")),
            PathBuf::from("/etc/ssh/key")
        );
    }

    #[test]
    fn test_expand_tilde_uses_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                expand_tilde(Path::new("~/.ssh/id_ed25519")),
                home.join(".ssh/id_ed25519")
            );
        }
    }
}
