use std::{fs, path::Path, str::FromStr, time::Duration};

use anyhow::Context as _;
use serde::Deserialize;

use crate::{mode::Mode, registry::Registry};

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub playback: PlaybackConfig,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct PlaybackConfig {
    /// Default mode for fresh cassettes; the `PLAYBACK_MODE` environment
    /// variable applies when absent.
    pub mode: Option<String>,
    #[serde(default)]
    pub with_file: bool,
    pub file_mask: Option<String>,
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub debug: bool,
    /// Regex over header names excluded from HTTP key derivation.
    pub exclude_headers: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Registry {
    pub fn from_config(config: &Config) -> anyhow::Result<std::sync::Arc<Registry>> {
        let playback = &config.playback;

        let mode = match playback.mode.as_deref() {
            Some(raw) => raw
                .parse::<Mode>()
                .with_context(|| format!("parse playback.mode `{raw}`"))?,
            None => Mode::from_env(),
        };

        let mut builder = Registry::builder()
            .default_mode(mode)
            .with_file(playback.with_file)
            .debug(playback.debug);
        if let Some(mask) = &playback.file_mask {
            builder = builder.file_mask(mask.clone());
        }
        if let Some(ttl_secs) = playback.ttl_secs {
            builder = builder.ttl(Duration::from_secs(ttl_secs));
        }
        if let Some(pattern) = &playback.exclude_headers {
            let pattern = regex::Regex::new(pattern)
                .with_context(|| format!("parse playback.exclude_headers `{pattern}`"))?;
            builder = builder.exclude_header(pattern);
        }
        Ok(builder.build())
    }
}
