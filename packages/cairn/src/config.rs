//! Repo configuration (`.cairn/config`, TOML).

use std::collections::BTreeMap;
use std::str::FromStr as _;

use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{fs, link::LinkKind, path::AbsFilePath};

/// The parsed repo configuration.
///
/// Everything is optional; a missing config file behaves like an empty
/// one.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub core: CoreConfig,
    pub cache: CacheConfig,

    /// Remote declarations by name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub remote: BTreeMap<String, RemoteConfig>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Name of the default remote.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,

    /// Parallelism for transfers; defaults to the CPU count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Link kinds to try, in order. Unset means the default order.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<String>>,

    /// Whether the one-shot slow-link warning may fire.
    pub slow_link_warning: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            types: None,
            slow_link_warning: true,
        }
    }
}

/// One configured remote. The URL is a directory path for the filesystem
/// backend: absolute, or relative to the repo root.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub url: String,
}

impl Config {
    /// Load the config file; a missing file is the default config.
    pub async fn load(path: &AbsFilePath) -> Result<Self> {
        let Some(text) = fs::read_buffered_utf8(path).await? else {
            return Ok(Self::default());
        };
        toml::from_str(&text).with_context(|| format!("parse config {path:?}"))
    }

    /// Write the config file.
    pub async fn save(&self, path: &AbsFilePath) -> Result<()> {
        let text = toml::to_string_pretty(self).context("serialize config")?;
        fs::write(path, text.as_bytes()).await
    }

    /// The configured link preference order, or the default.
    /// Unrecognized names are skipped with a warning rather than failing
    /// the whole invocation.
    pub fn link_kinds(&self) -> Vec<LinkKind> {
        match &self.cache.types {
            None => LinkKind::default_order(),
            Some(names) => {
                let kinds: Vec<LinkKind> = names
                    .iter()
                    .filter_map(|name| match LinkKind::from_str(name) {
                        Ok(kind) => Some(kind),
                        Err(_) => {
                            warn!(%name, "unknown cache.type entry, skipping");
                            None
                        }
                    })
                    .collect();
                if kinds.is_empty() {
                    LinkKind::default_order()
                } else {
                    kinds
                }
            }
        }
    }

    /// Whether the slow-link warning may fire: only when enabled and the
    /// user has not made an explicit cache-type choice.
    pub fn warn_slow_links(&self) -> bool {
        self.cache.slow_link_warning && self.cache.types.is_none()
    }

    /// Transfer parallelism.
    pub fn jobs(&self) -> usize {
        self.core.jobs.unwrap_or_else(num_cpus::get).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn empty_config_has_sane_defaults() {
        let config = Config::default();
        pretty_assert_eq!(config.link_kinds(), LinkKind::default_order());
        assert!(config.warn_slow_links());
        assert!(config.jobs() >= 1);
        assert!(config.core.remote.is_none());
    }

    #[test]
    fn parses_a_full_config() {
        let config: Config = toml::from_str(
            r#"
            [core]
            remote = "origin"
            jobs = 4

            [cache]
            type = ["hardlink", "copy"]
            slow_link_warning = false

            [remote.origin]
            url = "/srv/cairn-store"
            "#,
        )
        .unwrap();

        pretty_assert_eq!(config.core.remote.as_deref(), Some("origin"));
        pretty_assert_eq!(config.jobs(), 4);
        pretty_assert_eq!(
            config.link_kinds(),
            vec![LinkKind::Hardlink, LinkKind::Copy]
        );
        // Explicit cache.type silences the slow-link warning.
        assert!(!config.warn_slow_links());
        pretty_assert_eq!(config.remote["origin"].url, "/srv/cairn-store");
    }

    #[test]
    fn unknown_link_kinds_are_skipped() {
        let config: Config = toml::from_str("[cache]\ntype = [\"florp\", \"copy\"]\n").unwrap();
        pretty_assert_eq!(config.link_kinds(), vec![LinkKind::Copy]);
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = Config::default();
        config.core.remote = Some("origin".into());
        config.remote.insert(
            "origin".into(),
            RemoteConfig {
                url: "/srv/store".into(),
            },
        );
        let text = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        pretty_assert_eq!(back.core.remote.as_deref(), Some("origin"));
        pretty_assert_eq!(back.remote["origin"].url, "/srv/store");
    }
}
