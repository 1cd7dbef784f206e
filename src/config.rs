use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::storage::StorageConfig;
use crate::uplink::UplinkConfig;

/// Top-level application configuration loaded from file + environment.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub listen: ListenSection,
    /// Root directory of the default filesystem backend.
    pub storage: String,
    /// Reference to an alternative storage plugin, when not using the
    /// filesystem backend.
    pub store: Option<String>,
    /// Path prefix prepended to rewritten tarball URLs.
    pub url_prefix: String,
    /// Keeps `_rev` untouched on writes so fixtures stay reproducible.
    pub debug: bool,
    pub log: LogSection,
    /// Upstream registries, in consultation order.
    pub uplinks: Vec<UplinkDef>,
    /// Package access rules; the first matching pattern wins.
    pub packages: Vec<PackageRule>,
}

impl AppConfig {
    /// Load configuration from disk and environment.
    pub fn load() -> Result<Self> {
        let config_path = env::var("PACKRAT_CONFIG").unwrap_or_else(|_| "config.toml".to_string());

        let mut builder = config::Config::builder();

        if Path::new(&config_path).exists() {
            builder = builder.add_source(config::File::from(PathBuf::from(&config_path)));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("PACKRAT")
                .separator("_")
                .try_parsing(true),
        );

        let settings = builder.build()?;
        let mut config: Self = settings.try_deserialize()?;

        if config.storage.trim().is_empty() {
            config.storage = "./storage".to_string();
        }
        if config.log.level.trim().is_empty() {
            config.log.level = "info".to_string();
        }
        config.url_prefix = normalize_prefix(&config.url_prefix);

        for uplink in &config.uplinks {
            if uplink.name.trim().is_empty() {
                bail!("every uplink needs a name");
            }
            if uplink.config.url.trim().is_empty() {
                bail!("uplink {} is missing a url", uplink.name);
            }
        }

        Ok(config)
    }

    /// Resolve the storage backend configuration.
    pub fn storage_config(&self) -> Result<StorageConfig> {
        let result: std::result::Result<StorageConfig, std::convert::Infallible> = match &self.store
        {
            Some(reference) if reference != "local" => Ok(StorageConfig::Plugin {
                reference: reference.clone(),
            }),
            _ => Ok(StorageConfig::Local {
                path: PathBuf::from(&self.storage),
            }),
        };
        result.context("invalid storage configuration")
    }

    /// First package rule matching the given name.
    pub fn rule_for(&self, name: &str) -> Option<&PackageRule> {
        self.packages.iter().find(|rule| rule.matches(name))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenSection {
    pub host: String,
    pub port: u16,
}

impl Default for ListenSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4873,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

/// One configured upstream registry.
#[derive(Debug, Clone, Deserialize)]
pub struct UplinkDef {
    pub name: String,
    #[serde(flatten)]
    pub config: UplinkConfig,
}

/// Access rule for a set of packages selected by a wildcard pattern.
/// `proxy` names the uplinks consulted for these packages; an empty list
/// makes them private.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PackageRule {
    pub pattern: String,
    pub access: Vec<String>,
    pub publish: Vec<String>,
    pub proxy: Vec<String>,
}

impl Default for PackageRule {
    fn default() -> Self {
        Self {
            pattern: "**".to_string(),
            access: Vec::new(),
            publish: Vec::new(),
            proxy: Vec::new(),
        }
    }
}

impl PackageRule {
    pub fn matches(&self, name: &str) -> bool {
        pattern_matches(&self.pattern, name)
    }
}

/// Wildcard match over package names: `*` matches within a path segment,
/// `**` matches across segments.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    glob_match(&p, &n)
}

fn glob_match(pattern: &[char], name: &[char]) -> bool {
    match pattern.first() {
        None => name.is_empty(),
        Some('*') => {
            if pattern.get(1) == Some(&'*') {
                let rest = &pattern[2..];
                (0..=name.len()).any(|i| glob_match(rest, &name[i..]))
            } else {
                let rest = &pattern[1..];
                (0..=name.len())
                    .take_while(|&i| i == 0 || name[i - 1] != '/')
                    .any(|i| glob_match(rest, &name[i..]))
            }
        }
        Some(c) => name.first() == Some(c) && glob_match(&pattern[1..], &name[1..]),
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("**", "anything"));
        assert!(pattern_matches("**", "@scope/anything"));
        assert!(pattern_matches("local-*", "local-tools"));
        assert!(!pattern_matches("local-*", "other-tools"));
        assert!(pattern_matches("@internal/*", "@internal/logger"));
        assert!(!pattern_matches("@internal/*", "@other/logger"));
        // `*` never crosses a slash; `**` does.
        assert!(!pattern_matches("*", "@scope/pkg"));
        assert!(pattern_matches("**", "@scope/pkg"));
        assert!(pattern_matches("react", "react"));
        assert!(!pattern_matches("react", "react-dom"));
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let config = AppConfig {
            packages: vec![
                PackageRule {
                    pattern: "@internal/*".to_string(),
                    proxy: Vec::new(),
                    ..PackageRule::default()
                },
                PackageRule {
                    pattern: "**".to_string(),
                    proxy: vec!["npmjs".to_string()],
                    ..PackageRule::default()
                },
            ],
            ..AppConfig::default()
        };

        let rule = config.rule_for("@internal/logger").unwrap();
        assert!(rule.proxy.is_empty());
        let rule = config.rule_for("react").unwrap();
        assert_eq!(rule.proxy, vec!["npmjs"]);
    }

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/"), "");
        assert_eq!(normalize_prefix("registry/"), "/registry");
        assert_eq!(normalize_prefix("/registry"), "/registry");
    }
}
