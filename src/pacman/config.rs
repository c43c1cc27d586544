//! Config file resolution, parsing, and validation (§7, ambient).
//!
//! Grounded in the teacher's `config.rs` resolution/templating shape
//! (`resolve_config_path`, extension-based format dispatch), adapted to
//! PACman's schema and its one deliberate deviation: no default-template
//! generation. An unconfigured dispatcher is a no-op, not a scaffolded
//! starter file.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use directories::{BaseDirs, ProjectDirs};
use serde::Deserialize;
use url::Url;

use super::error::{PacmanError, Result};
use super::net::normalize_bind_addr;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: Option<SocketAddr>,
    pub proxies: HashMap<String, Url>,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub hosts: Vec<String>,
    pub proxies: Vec<String>,
}

/// Resolves the config path per the precedence in §7: an explicit path (the
/// flag/`PACMAN_CONFIG` pair is already merged into one `Option` by clap's
/// `env` attribute before this is called) beats the two well-known
/// candidates, which are probed in order and the first existing file wins.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(expand_tilde(p));
    }

    let mut candidates = Vec::new();
    if let Some(home) = home_dir() {
        candidates.push(home.join(".config").join("pacman").join("config.yaml"));
    }
    if let Some(proj) = ProjectDirs::from("com", "pacman", "pacman") {
        candidates.push(proj.config_dir().join("config.yaml"));
    }

    candidates
        .into_iter()
        .find(|p| p.is_file())
        .ok_or_else(|| {
            PacmanError::ConfigError(
                "no config file found (looked for --config/PACMAN_CONFIG, \
                 ~/.config/pacman/config.yaml, and the OS config directory); \
                 pacman does not generate one automatically"
                    .to_string(),
            )
        })
}

/// Expands a leading `~` against the current user's home directory. Paths
/// without a leading `~` pass through unchanged.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    match s.strip_prefix('~') {
        Some(rest) if rest.is_empty() => home_dir().unwrap_or_else(|| path.to_path_buf()),
        Some(rest) if rest.starts_with('/') => match home_dir() {
            Some(home) => home.join(rest.trim_start_matches('/')),
            None => path.to_path_buf(),
        },
        _ => path.to_path_buf(),
    }
}

fn home_dir() -> Option<PathBuf> {
    BaseDirs::new().map(|b| b.home_dir().to_path_buf())
}

/// Loads and validates the config at `path`. Format is chosen by extension:
/// `.yaml`/`.yml` via `serde_yaml`, `.json` via `serde_json`.
pub fn load(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| PacmanError::ConfigError(format!("read {}: {e}", path.display())))?;

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let file: FileConfig = match ext.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&raw)
            .map_err(|e| PacmanError::ConfigError(format!("parse {}: {e}", path.display())))?,
        "json" => serde_json::from_str(&raw)
            .map_err(|e| PacmanError::ConfigError(format!("parse {}: {e}", path.display())))?,
        other => {
            return Err(PacmanError::ConfigError(format!(
                "unsupported config extension {other:?} (expected .yaml, .yml, or .json)"
            )));
        }
    };

    Config::from_file(file)
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    listen: Option<String>,
    #[serde(default)]
    proxies: HashMap<String, String>,
    #[serde(default)]
    rules: Vec<FileRule>,
}

#[derive(Debug, Deserialize)]
struct FileRule {
    hosts: Vec<String>,
    #[serde(default)]
    proxies: Vec<String>,
}

impl Config {
    fn from_file(file: FileConfig) -> Result<Self> {
        let listen = file
            .listen
            .as_deref()
            .map(|s| {
                normalize_bind_addr(s)
                    .parse::<SocketAddr>()
                    .map_err(|e| PacmanError::ConfigError(format!("listen {s:?}: {e}")))
            })
            .transpose()?;

        let mut proxies = HashMap::with_capacity(file.proxies.len());
        for (name, raw_url) in file.proxies {
            let url = Url::parse(&raw_url).map_err(|e| {
                PacmanError::ConfigError(format!("proxy {name:?}: invalid URL {raw_url:?}: {e}"))
            })?;
            proxies.insert(name, url);
        }

        let rules = file
            .rules
            .into_iter()
            .map(|r| Rule {
                hosts: r.hosts,
                proxies: r.proxies,
            })
            .collect::<Vec<_>>();

        for rule in &rules {
            for name in &rule.proxies {
                if !proxies.contains_key(name) {
                    return Err(PacmanError::ConfigError(format!(
                        "rule references undefined proxy {name:?}"
                    )));
                }
            }
        }

        Ok(Config {
            listen,
            proxies,
            rules,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_round_trip_with_valid_rule() {
        let dir = std::env::temp_dir().join(format!("pacman-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        std::fs::write(
            &path,
            "listen: \"127.0.0.1:11078\"\n\
             proxies:\n  corp: \"http://proxy:3128\"\n\
             rules:\n  - hosts: [\"*.internal.example.com\"]\n    proxies: [\"corp\"]\n",
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.listen, Some("127.0.0.1:11078".parse().unwrap()));
        assert!(config.proxies.contains_key("corp"));
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].proxies, vec!["corp".to_string()]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_rule_referencing_unknown_proxy() {
        let dir = std::env::temp_dir().join(format!("pacman-config-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        std::fs::write(
            &path,
            "proxies: {}\nrules:\n  - hosts: [\"x.com\"]\n    proxies: [\"missing\"]\n",
        )
        .unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(err, PacmanError::ConfigError(_)));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_unsupported_extension() {
        let dir = std::env::temp_dir().join(format!("pacman-config-test3-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "listen = \"127.0.0.1:11078\"\n").unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(err, PacmanError::ConfigError(_)));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn expand_tilde_prefix() {
        if let Some(home) = home_dir() {
            let expanded = expand_tilde(Path::new("~/config.yaml"));
            assert_eq!(expanded, home.join("config.yaml"));
        }
    }
}
