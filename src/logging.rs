use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

use crate::{
    config::{Config, LogFormat},
    mode::Mode,
};

/// Installs the process-wide tracing subscriber and announces the playback
/// defaults the fabric will run under.
pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let level = level_filter(requested_level(config, cli_level_override))?;

    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true);
    match chosen_format(config) {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    }
    .map_err(|err| anyhow!("install tracing subscriber: {err}"))?;

    tracing::info!(
        default_mode = %announced_mode(config),
        with_file = config.playback.with_file,
        cassette_debug = config.playback.debug,
        "playback logging ready"
    );
    Ok(())
}

fn requested_level<'a>(
    config: &'a Config,
    cli_level_override: Option<&'a str>,
) -> Option<&'a str> {
    cli_level_override.or_else(|| config.logging.as_ref()?.level.as_deref())
}

fn level_filter(requested: Option<&str>) -> anyhow::Result<LevelFilter> {
    let Some(requested) = requested else {
        return Ok(LevelFilter::INFO);
    };
    requested
        .trim()
        .to_ascii_lowercase()
        .parse::<LevelFilter>()
        .map_err(|_| {
            anyhow!("unknown log level `{requested}` (try error, warn, info, debug, trace or off)")
        })
}

fn chosen_format(config: &Config) -> LogFormat {
    match config.logging.as_ref().and_then(|logging| logging.format) {
        Some(format) => format,
        None => LogFormat::Json,
    }
}

/// The mode fresh cassettes will default to, as `Registry::from_config`
/// resolves it. A malformed mode string is rejected there; the announcement
/// only reports, so it falls back to Off.
fn announced_mode(config: &Config) -> Mode {
    match config.playback.mode.as_deref() {
        Some(raw) => raw.parse().unwrap_or(Mode::Off),
        None => Mode::from_env(),
    }
}
