pub mod env;
pub mod key;
pub mod parse;
pub mod types;

use regex::Regex;
use std::path::{Path, PathBuf};

pub use key::{load_private_key, mask, parse_key};
pub use parse::{load_config, validate_config, ConfigError};
pub use types::{BatchConfig, BridgeConfig, DestinationConfig, RunConfig, SourceConfig};

/// Expands environment variables in a string.
/// Supports $env{VAR_NAME} syntax.
/// If an environment variable is not set, it's left unchanged.
pub fn expand_env_vars(text: &str) -> String {
    let re = Regex::new(r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();

    re.replace_all(text, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    })
    .to_string()
}

/// Expands a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(rest);
        }
    } else if path_str == "~" {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir;
        }
    }

    path.to_path_buf()
}

/// Resolves the config file path.
/// Returns the first existing path from:
/// 1. Explicit path (if provided, with tilde expansion)
/// 2. ~/.config/pubsub2oci/config.yml
/// 3. /etc/pubsub2oci/config.yml
///
/// `None` means the environment is the only configuration source.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(expand_tilde(path));
    }

    if let Some(home_dir) = dirs::home_dir() {
        let user_config = home_dir.join(".config/pubsub2oci/config.yml");
        if user_config.exists() {
            return Some(user_config);
        }
    }

    let system_config = PathBuf::from("/etc/pubsub2oci/config.yml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_expand_env_vars_multiple() {
        std::env::set_var("PUBSUB2OCI_TEST_VAR1", "value1");
        std::env::set_var("PUBSUB2OCI_TEST_VAR2", "value2");
        let result = expand_env_vars("$env{PUBSUB2OCI_TEST_VAR1}/middle/$env{PUBSUB2OCI_TEST_VAR2}");
        assert_eq!(result, "value1/middle/value2");
        std::env::remove_var("PUBSUB2OCI_TEST_VAR1");
        std::env::remove_var("PUBSUB2OCI_TEST_VAR2");
    }

    #[test]
    fn test_expand_env_vars_unset() {
        let result = expand_env_vars("key: $env{PUBSUB2OCI_NONEXISTENT_VAR}");
        // Unset variables are left unchanged
        assert_eq!(result, "key: $env{PUBSUB2OCI_NONEXISTENT_VAR}");
    }

    #[test]
    fn test_expand_env_vars_ignores_shell_syntax() {
        let result = expand_env_vars("${HOME}:$HOME");
        assert_eq!(result, "${HOME}:$HOME");
    }

    #[test]
    fn test_expand_tilde_with_path() {
        let expanded = expand_tilde(Path::new("~/.oci/oci_api_key.pem"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join(".oci/oci_api_key.pem"));
        }
    }

    #[test]
    fn test_expand_tilde_no_expansion() {
        assert_eq!(
            expand_tilde(Path::new("/absolute/path")),
            Path::new("/absolute/path")
        );
        assert_eq!(
            expand_tilde(Path::new("relative/~path")),
            Path::new("relative/~path")
        );
    }

    #[test]
    fn test_explicit_config_path_wins() {
        assert_eq!(
            resolve_config_path(Some(Path::new("/tmp/bridge.yml"))),
            Some(PathBuf::from("/tmp/bridge.yml"))
        );
    }
}
