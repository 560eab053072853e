use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Environment variable consulted when no mode flag is given.
pub const MODE_ENV: &str = "PLAYBACK_MODE";

/// How a cassette treats the calls that run against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mode {
    /// Calls go straight to the real collaborator; the cassette is untouched.
    #[default]
    Off,
    /// Calls are satisfied from the cassette.
    Playback,
    /// Calls hit the real collaborator and the exchange is appended.
    Record,
    /// Playback first; fall through to record when the record is missing.
    PlaybackOrRecord,
    /// Playback first; fall through to record on any playback error.
    PlaybackSuccessOrRecord,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Off => "",
            Mode::Playback => "Playback",
            Mode::Record => "Record",
            Mode::PlaybackOrRecord => "PlaybackOrRecord",
            Mode::PlaybackSuccessOrRecord => "PlaybackSuccessOrRecord",
        }
    }

    /// Resolves the process-default mode from `PLAYBACK_MODE`.
    pub fn from_env() -> Mode {
        std::env::var(MODE_ENV)
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(Mode::Off)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseModeError {
    raw: String,
}

impl std::fmt::Display for ParseModeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid playback mode `{}`; expected one of Playback, Record, PlaybackOrRecord, PlaybackSuccessOrRecord or empty",
            self.raw
        )
    }
}

impl std::error::Error for ParseModeError {}

impl FromStr for Mode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(Mode::Off),
            "Playback" => Ok(Mode::Playback),
            "Record" => Ok(Mode::Record),
            "PlaybackOrRecord" => Ok(Mode::PlaybackOrRecord),
            "PlaybackSuccessOrRecord" => Ok(Mode::PlaybackSuccessOrRecord),
            raw => Err(ParseModeError {
                raw: raw.to_owned(),
            }),
        }
    }
}

/// When the cassette writer is flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncMode {
    /// Flush on `lock`/`finalize` only.
    #[default]
    Default,
    /// Flush after every appended record.
    EveryChange,
}

/// What kind of backing path a cassette writer reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathType {
    #[default]
    Nil,
    File,
}

impl PathType {
    pub fn as_str(self) -> &'static str {
        match self {
            PathType::Nil => "",
            PathType::File => "file",
        }
    }
}

impl std::fmt::Display for PathType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PathType {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(PathType::Nil),
            "file" => Ok(PathType::File),
            raw => Err(ParseModeError {
                raw: raw.to_owned(),
            }),
        }
    }
}
