use std::any::Any;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Errors raised by the cassette fabric itself.
///
/// Collaborator errors captured during recording are not part of this
/// taxonomy; they travel inside records as [`RecordedError`] and are returned
/// to the caller as part of the replayed outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No record available, the stored type disagrees with the caller's type,
    /// or the stored payload cannot be parsed.
    PlaybackFailed,
    /// The underlying track miss; promoted to `PlaybackFailed` at recorder
    /// boundaries.
    CassetteGetFailed,
    /// Write attempt on a locked cassette.
    CassetteLocked,
    /// An error the real collaborator returned, surfaced through a recorder.
    Captured(RecordedError),
    Io(String),
    Yaml(String),
    Json(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PlaybackFailed => f.write_str("playback failed"),
            Self::CassetteGetFailed => f.write_str("cassette get failed"),
            Self::CassetteLocked => f.write_str("cassette locked"),
            Self::Captured(err) => write!(f, "{err}"),
            Self::Io(message) | Self::Yaml(message) | Self::Json(message) => {
                f.write_str(message)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

const ERR_TYPE_DEADLINE_EXCEEDED: &str = "DeadlineExceeded";

/// An error returned by a real collaborator, captured into a record.
///
/// Well-known sentinels round-trip as themselves rather than as plain
/// strings, so a deadline error replayed from a cassette still compares equal
/// to a live deadline error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedError {
    DeadlineExceeded,
    Message(String),
}

impl RecordedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    fn tag(&self) -> std::borrow::Cow<'_, str> {
        match self {
            Self::DeadlineExceeded => ERR_TYPE_DEADLINE_EXCEEDED.into(),
            Self::Message(message) => message.as_str().into(),
        }
    }

    fn from_tag(tag: String) -> Self {
        match tag.as_str() {
            ERR_TYPE_DEADLINE_EXCEEDED => Self::DeadlineExceeded,
            _ => Self::Message(tag),
        }
    }
}

impl std::fmt::Display for RecordedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeadlineExceeded => f.write_str("deadline exceeded"),
            Self::Message(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for RecordedError {}

impl From<tokio::time::error::Elapsed> for RecordedError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::DeadlineExceeded
    }
}

impl Serialize for RecordedError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.tag())
    }
}

impl<'de> Deserialize<'de> for RecordedError {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::from_tag(String::deserialize(deserializer)?))
    }
}

/// Renders a panic payload into the string form stored on records.
///
/// `&str` and `String` payloads round-trip verbatim; anything else loses its
/// type identity and is replayed as a placeholder string.
pub fn panic_payload(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_owned();
    }
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(_) => "panic with non-string payload".to_owned(),
    }
}

/// Runs an owned future on its own task so a panic inside it can be harvested
/// instead of tearing down the caller.
pub(crate) async fn spawn_guarded<T, F>(future: F) -> Result<T, String>
where
    T: Send + 'static,
    F: std::future::Future<Output = T> + Send + 'static,
{
    match tokio::spawn(future).await {
        Ok(value) => Ok(value),
        Err(join_err) => match join_err.try_into_panic() {
            Ok(payload) => Err(panic_payload(payload)),
            Err(join_err) => Err(join_err.to_string()),
        },
    }
}
