use serde::{Deserialize, Serialize};

use crate::errors::{Error, RecordedError};

/// Which integration produced a record; together with the key it selects the
/// track the record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Result,
    Http,
    HttpRequest,
    GrpcRequest,
    SqlRows,
    SqlResult,
    SqlStmt,
}

impl RecordKind {
    /// The inbound-request echo slots are recorded once and not consumed
    /// during replay, so playback success ignores their cursors.
    pub fn is_inbound_echo(self) -> bool {
        matches!(self, RecordKind::HttpRequest | RecordKind::GrpcRequest)
    }
}

/// One logged interaction. Request and response payloads are opaque strings;
/// only the recorder that produced them knows how to parse them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub kind: RecordKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default)]
    pub id: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_meta: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub response_meta: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<RecordedError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panic: Option<String>,
}

impl Record {
    pub fn new(kind: RecordKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            id: 0,
            request_meta: String::new(),
            request: String::new(),
            response_meta: String::new(),
            response: String::new(),
            err: None,
            panic: None,
        }
    }

    /// Re-raises the captured panic, if any. Callers invoke this only after
    /// the record has been safely appended to its cassette.
    pub fn panic_if_has(&self) {
        if let Some(payload) = &self.panic {
            std::panic::panic_any(payload.clone());
        }
    }
}

/// Serializes records as a YAML list fragment. Appending fragments to a file
/// yields one document that parses back as a single list.
pub fn marshal_fragment(records: &[Record]) -> Result<String, Error> {
    Ok(serde_yaml::to_string(records)?)
}

/// Parses a cassette document: the concatenation of every fragment ever
/// appended, read back as one record list.
pub fn unmarshal_records(dump: &[u8]) -> Result<Vec<Record>, Error> {
    Ok(serde_yaml::from_slice(dump)?)
}
