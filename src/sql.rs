use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    cassette::Cassette,
    context::Context,
    errors::{Error, RecordedError, spawn_guarded},
    record::{Record, RecordKind},
    recorder::{BoxFuture, Recorder, run},
};

/// One cell of a result set. The serialized form is plain JSON (numbers,
/// strings, booleans, null); the column type tags recover the richer types
/// on replay.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
    Time(DateTime<Utc>),
    List(Vec<SqlValue>),
}

impl SqlValue {
    fn type_tag(&self) -> String {
        match self {
            SqlValue::Null => String::new(),
            SqlValue::Int(_) => "int64".to_owned(),
            SqlValue::Float(_) => "float64".to_owned(),
            SqlValue::Bool(_) => "bool".to_owned(),
            SqlValue::Text(_) => "string".to_owned(),
            SqlValue::Bytes(_) => "[]byte".to_owned(),
            SqlValue::Time(_) => "time.Time".to_owned(),
            SqlValue::List(values) => {
                let inner = values
                    .first()
                    .map(SqlValue::type_tag)
                    .unwrap_or_default();
                format!("[]{inner}")
            }
        }
    }

    fn from_json(value: serde_json::Value) -> SqlValue {
        match value {
            serde_json::Value::Null => SqlValue::Null,
            serde_json::Value::Bool(b) => SqlValue::Bool(b),
            serde_json::Value::Number(number) => match number.as_i64() {
                Some(int) => SqlValue::Int(int),
                None => SqlValue::Float(number.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(text) => SqlValue::Text(text),
            serde_json::Value::Array(items) => {
                SqlValue::List(items.into_iter().map(SqlValue::from_json).collect())
            }
            serde_json::Value::Object(_) => SqlValue::Null,
        }
    }

    /// Recovers the typed form a flat JSON value lost, as demanded by the
    /// column type tag.
    fn restore(self, type_tag: &str) -> SqlValue {
        match (type_tag, self) {
            ("int64", SqlValue::Float(f)) => SqlValue::Int(f as i64),
            ("[]byte" | "[]uint8", SqlValue::Text(text)) => SqlValue::Bytes(text.into_bytes()),
            ("time.Time", SqlValue::Text(text)) => match DateTime::parse_from_rfc3339(&text) {
                Ok(parsed) => SqlValue::Time(parsed.with_timezone(&Utc)),
                Err(_) => SqlValue::Text(text),
            },
            (_, value) => value,
        }
    }
}

impl Serialize for SqlValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SqlValue::Null => serializer.serialize_unit(),
            SqlValue::Int(v) => serializer.serialize_i64(*v),
            SqlValue::Float(v) => serializer.serialize_f64(*v),
            SqlValue::Bool(v) => serializer.serialize_bool(*v),
            SqlValue::Text(v) => serializer.serialize_str(v),
            SqlValue::Bytes(v) => serializer.serialize_str(&String::from_utf8_lossy(v)),
            SqlValue::Time(v) => serializer.serialize_str(&v.to_rfc3339()),
            SqlValue::List(values) => values.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for SqlValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(SqlValue::from_json(value))
    }
}

/// A replayable result set: the rows a driver produced, drained into plain
/// data. Implementations of [`SqlRows`] stream rows; the mock is both the
/// snapshot target at record time and the iterator handed out on replay.
pub trait SqlRows: Send + std::fmt::Debug {
    fn columns(&self) -> Vec<String>;
    /// The next row in recorded order; `None` once exhausted.
    fn next_row(&mut self) -> Option<Vec<SqlValue>>;
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MockRows {
    pub columns: Vec<String>,
    pub column_types: Vec<String>,
    pub values: Vec<Vec<SqlValue>>,
    #[serde(skip)]
    cursor: usize,
}

impl MockRows {
    pub fn new(columns: Vec<String>, values: Vec<Vec<SqlValue>>) -> Self {
        let mut rows = Self {
            columns,
            column_types: Vec::new(),
            values,
            cursor: 0,
        };
        rows.define_column_types();
        rows
    }

    /// Drains a driver's row stream into a snapshot.
    pub fn from_rows(source: &mut dyn SqlRows) -> Self {
        let columns = source.columns();
        let mut values = Vec::with_capacity(2);
        while let Some(row) = source.next_row() {
            values.push(row);
        }
        Self::new(columns, values)
    }

    pub fn marshal(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn unmarshal(data: &str) -> Result<Self, Error> {
        let mut rows: MockRows = serde_json::from_str(data)?;
        rows.restore_value_types();
        Ok(rows)
    }

    /// Per-column type tags, inferred by scanning values: first non-null
    /// wins; columns with only nulls keep `""` and stay nullable on replay.
    fn define_column_types(&mut self) {
        self.column_types = vec![String::new(); self.columns.len()];
        let mut unresolved = self.columns.len();
        for row in &self.values {
            if unresolved == 0 {
                break;
            }
            for (idx, value) in row.iter().enumerate() {
                if idx >= self.column_types.len() || !self.column_types[idx].is_empty() {
                    continue;
                }
                if matches!(value, SqlValue::Null) {
                    continue;
                }
                self.column_types[idx] = value.type_tag();
                unresolved -= 1;
            }
        }
    }

    fn restore_value_types(&mut self) {
        for row in &mut self.values {
            for (idx, cell) in row.iter_mut().enumerate() {
                let Some(type_tag) = self.column_types.get(idx) else {
                    continue;
                };
                if type_tag.is_empty() || matches!(cell, SqlValue::Null) {
                    continue;
                }
                let value = std::mem::replace(cell, SqlValue::Null);
                *cell = value.restore(type_tag);
            }
        }
    }
}

impl SqlRows for MockRows {
    fn columns(&self) -> Vec<String> {
        self.columns.clone()
    }

    fn next_row(&mut self) -> Option<Vec<SqlValue>> {
        let row = self.values.get(self.cursor).cloned()?;
        self.cursor += 1;
        Some(row)
    }
}

/// What a driver's execute reported, before snapshotting.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutcome {
    pub last_insert_id: Result<i64, RecordedError>,
    pub rows_affected: Result<i64, RecordedError>,
}

/// Replayable execute result.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MockExecResult {
    #[serde(default)]
    pub last_insert_id: i64,
    #[serde(default)]
    pub rows_affected: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_insert_id_err: Option<RecordedError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_affected_err: Option<RecordedError>,
}

impl MockExecResult {
    pub fn last_insert_id(&self) -> Result<i64, RecordedError> {
        match &self.last_insert_id_err {
            Some(err) => Err(err.clone()),
            None => Ok(self.last_insert_id),
        }
    }

    pub fn rows_affected(&self) -> Result<i64, RecordedError> {
        match &self.rows_affected_err {
            Some(err) => Err(err.clone()),
            None => Ok(self.rows_affected),
        }
    }
}

impl From<ExecOutcome> for MockExecResult {
    fn from(outcome: ExecOutcome) -> Self {
        let mut mock = MockExecResult::default();
        match outcome.last_insert_id {
            Ok(id) => mock.last_insert_id = id,
            Err(err) => mock.last_insert_id_err = Some(err),
        }
        match outcome.rows_affected {
            Ok(count) => mock.rows_affected = count,
            Err(err) => mock.rows_affected_err = Some(err),
        }
        mock
    }
}

/// Driver seam for queries returning rows.
pub trait RowsPort: Send + Sync {
    fn query(
        &self,
        query: String,
        args: Vec<SqlValue>,
    ) -> BoxFuture<Result<Box<dyn SqlRows>, RecordedError>>;
}

/// Driver seam for executes.
pub trait ExecPort: Send + Sync {
    fn exec(
        &self,
        query: String,
        args: Vec<SqlValue>,
    ) -> BoxFuture<Result<ExecOutcome, RecordedError>>;
}

/// Driver seam for statement preparation.
pub trait StmtPort: Send + Sync {
    fn prepare(&self, query: String) -> BoxFuture<Result<Arc<dyn PreparedStmt>, RecordedError>>;
}

/// A live prepared statement on the real driver side.
pub trait PreparedStmt: Send + Sync {
    fn num_input(&self) -> i64;
    fn exec(&self, args: Vec<SqlValue>) -> BoxFuture<Result<ExecOutcome, RecordedError>>;
    fn query(&self, args: Vec<SqlValue>) -> BoxFuture<Result<Box<dyn SqlRows>, RecordedError>>;
}

/// Runs a row query through the context's cassette.
pub async fn query(
    ctx: &Context,
    port: &Arc<dyn RowsPort>,
    query: &str,
    args: Vec<SqlValue>,
) -> Result<Box<dyn SqlRows>, Error> {
    query_on(ctx.cassette().cloned(), port, query, args).await
}

/// Runs an execute through the context's cassette.
pub async fn exec(
    ctx: &Context,
    port: &Arc<dyn ExecPort>,
    query: &str,
    args: Vec<SqlValue>,
) -> Result<MockExecResult, Error> {
    exec_on(ctx.cassette().cloned(), port, query, args).await
}

/// Prepares a statement through the context's cassette. The returned mock
/// dispatches its own `exec`/`query` through the same cassette, keyed by the
/// same query text.
pub async fn prepare(
    ctx: &Context,
    port: &Arc<dyn StmtPort>,
    query: &str,
) -> Result<MockStmt, Error> {
    let mut recorder = SqlStmtRecorder {
        cassette: ctx.cassette().cloned(),
        port: Arc::clone(port),
        query: query.to_owned(),
        stmt: None,
        err: None,
    };
    let run_outcome = run(ctx.cassette(), &mut recorder).await;

    if let Some(err) = recorder.err.take() {
        return Err(Error::Captured(err));
    }
    match recorder.stmt.take() {
        Some(stmt) => Ok(stmt),
        None => Err(run_outcome.err().unwrap_or(Error::PlaybackFailed)),
    }
}

async fn query_on(
    cassette: Option<Arc<Cassette>>,
    port: &Arc<dyn RowsPort>,
    query: &str,
    args: Vec<SqlValue>,
) -> Result<Box<dyn SqlRows>, Error> {
    let mut recorder = SqlRowsRecorder {
        cassette: cassette.clone(),
        port: Arc::clone(port),
        query: query.to_owned(),
        args,
        rows: None,
        err: None,
    };
    let run_outcome = run(cassette.as_ref(), &mut recorder).await;

    if let Some(err) = recorder.err.take() {
        return Err(Error::Captured(err));
    }
    match recorder.rows.take() {
        Some(rows) => Ok(rows),
        None => Err(run_outcome.err().unwrap_or(Error::PlaybackFailed)),
    }
}

async fn exec_on(
    cassette: Option<Arc<Cassette>>,
    port: &Arc<dyn ExecPort>,
    query: &str,
    args: Vec<SqlValue>,
) -> Result<MockExecResult, Error> {
    let mut recorder = SqlExecRecorder {
        cassette: cassette.clone(),
        port: Arc::clone(port),
        query: query.to_owned(),
        args,
        result: None,
        err: None,
    };
    let run_outcome = run(cassette.as_ref(), &mut recorder).await;

    if let Some(err) = recorder.err.take() {
        return Err(Error::Captured(err));
    }
    match recorder.result.take() {
        Some(result) => Ok(result),
        None => Err(run_outcome.err().unwrap_or(Error::PlaybackFailed)),
    }
}

fn request_dump(query: &str, args: &[SqlValue]) -> String {
    // Bound args are diagnostics only; the track cursor disambiguates
    // repeated executions of the same query.
    format!("{query}\n{args:?}\n")
}

struct SqlRowsRecorder {
    cassette: Option<Arc<Cassette>>,
    port: Arc<dyn RowsPort>,
    query: String,
    args: Vec<SqlValue>,
    rows: Option<Box<dyn SqlRows>>,
    err: Option<RecordedError>,
}

impl Recorder for SqlRowsRecorder {
    async fn call(&mut self) -> Result<(), Error> {
        match self.port.query(self.query.clone(), self.args.clone()).await {
            Ok(rows) => self.rows = Some(rows),
            Err(err) => self.err = Some(err),
        }
        Ok(())
    }

    async fn record(&mut self) -> Result<(), Error> {
        let Some(cassette) = self.cassette.clone() else {
            return self.call().await;
        };

        let mut rec = Record::new(RecordKind::SqlRows, self.query.clone());
        rec.request = request_dump(&self.query, &self.args);
        rec.id = cassette.add(rec.clone())?;

        let future = self.port.query(self.query.clone(), self.args.clone());
        match spawn_guarded(future).await {
            Ok(Ok(mut rows)) => {
                let mock = MockRows::from_rows(rows.as_mut());
                rec.response = mock.marshal()?;
                self.rows = Some(Box::new(mock));
            }
            Ok(Err(err)) => {
                rec.err = Some(err.clone());
                self.err = Some(err);
            }
            Err(payload) => rec.panic = Some(payload),
        }

        let added = cassette.add(rec.clone());
        rec.panic_if_has();
        added.map(|_| ())
    }

    async fn playback(&mut self) -> Result<(), Error> {
        let Some(cassette) = self.cassette.clone() else {
            return Err(Error::PlaybackFailed);
        };

        let rec = cassette
            .get(RecordKind::SqlRows, &self.query)
            .map_err(|_| Error::PlaybackFailed)?;

        if !rec.response.is_empty() {
            let rows = MockRows::unmarshal(&rec.response).map_err(|_| Error::PlaybackFailed)?;
            self.rows = Some(Box::new(rows));
        }
        self.err = rec.err.clone();

        rec.panic_if_has();
        if self.rows.is_none() && self.err.is_none() {
            return Err(Error::PlaybackFailed);
        }
        Ok(())
    }
}

struct SqlExecRecorder {
    cassette: Option<Arc<Cassette>>,
    port: Arc<dyn ExecPort>,
    query: String,
    args: Vec<SqlValue>,
    result: Option<MockExecResult>,
    err: Option<RecordedError>,
}

impl Recorder for SqlExecRecorder {
    async fn call(&mut self) -> Result<(), Error> {
        match self.port.exec(self.query.clone(), self.args.clone()).await {
            Ok(outcome) => self.result = Some(outcome.into()),
            Err(err) => self.err = Some(err),
        }
        Ok(())
    }

    async fn record(&mut self) -> Result<(), Error> {
        let Some(cassette) = self.cassette.clone() else {
            return self.call().await;
        };

        let mut rec = Record::new(RecordKind::SqlResult, self.query.clone());
        rec.request = request_dump(&self.query, &self.args);
        rec.id = cassette.add(rec.clone())?;

        let future = self.port.exec(self.query.clone(), self.args.clone());
        match spawn_guarded(future).await {
            Ok(Ok(outcome)) => {
                let mock: MockExecResult = outcome.into();
                rec.response = serde_json::to_string(&mock)?;
                self.result = Some(mock);
            }
            Ok(Err(err)) => {
                rec.err = Some(err.clone());
                self.err = Some(err);
            }
            Err(payload) => rec.panic = Some(payload),
        }

        let added = cassette.add(rec.clone());
        rec.panic_if_has();
        added.map(|_| ())
    }

    async fn playback(&mut self) -> Result<(), Error> {
        let Some(cassette) = self.cassette.clone() else {
            return Err(Error::PlaybackFailed);
        };

        let rec = cassette
            .get(RecordKind::SqlResult, &self.query)
            .map_err(|_| Error::PlaybackFailed)?;

        if !rec.response.is_empty() {
            let result: MockExecResult =
                serde_json::from_str(&rec.response).map_err(|_| Error::PlaybackFailed)?;
            self.result = Some(result);
        }
        self.err = rec.err.clone();

        rec.panic_if_has();
        if self.result.is_none() && self.err.is_none() {
            return Err(Error::PlaybackFailed);
        }
        Ok(())
    }
}

/// A prepared statement that replays: `(query, num_input)` captured at
/// prepare time, dispatching its own exec/query through the owning cassette.
pub struct MockStmt {
    query: String,
    num_input: i64,
    cassette: Option<Arc<Cassette>>,
    real: Option<Arc<dyn PreparedStmt>>,
}

#[derive(Serialize, Deserialize)]
struct StmtSnapshot {
    query: String,
    num_input: i64,
}

impl MockStmt {
    fn attached(query: String, real: Arc<dyn PreparedStmt>, cassette: Option<Arc<Cassette>>) -> Self {
        Self {
            num_input: real.num_input(),
            query,
            cassette,
            real: Some(real),
        }
    }

    fn detached(query: String, num_input: i64, cassette: Option<Arc<Cassette>>) -> Self {
        Self {
            query,
            num_input,
            cassette,
            real: None,
        }
    }

    pub fn num_input(&self) -> i64 {
        self.num_input
    }

    pub fn query_text(&self) -> &str {
        &self.query
    }

    pub async fn exec(&self, args: Vec<SqlValue>) -> Result<MockExecResult, Error> {
        let port: Arc<dyn ExecPort> = Arc::new(StmtExecPort {
            stmt: self.real.clone(),
        });
        exec_on(self.cassette.clone(), &port, &self.query, args).await
    }

    pub async fn query(&self, args: Vec<SqlValue>) -> Result<Box<dyn SqlRows>, Error> {
        let port: Arc<dyn RowsPort> = Arc::new(StmtRowsPort {
            stmt: self.real.clone(),
        });
        query_on(self.cassette.clone(), &port, &self.query, args).await
    }
}

struct StmtExecPort {
    stmt: Option<Arc<dyn PreparedStmt>>,
}

impl ExecPort for StmtExecPort {
    fn exec(&self, _query: String, args: Vec<SqlValue>) -> BoxFuture<Result<ExecOutcome, RecordedError>> {
        match &self.stmt {
            Some(stmt) => stmt.exec(args),
            None => Box::pin(async { Err(RecordedError::new("statement has no live connection")) }),
        }
    }
}

struct StmtRowsPort {
    stmt: Option<Arc<dyn PreparedStmt>>,
}

impl RowsPort for StmtRowsPort {
    fn query(
        &self,
        _query: String,
        args: Vec<SqlValue>,
    ) -> BoxFuture<Result<Box<dyn SqlRows>, RecordedError>> {
        match &self.stmt {
            Some(stmt) => stmt.query(args),
            None => Box::pin(async { Err(RecordedError::new("statement has no live connection")) }),
        }
    }
}

struct SqlStmtRecorder {
    cassette: Option<Arc<Cassette>>,
    port: Arc<dyn StmtPort>,
    query: String,
    stmt: Option<MockStmt>,
    err: Option<RecordedError>,
}

impl Recorder for SqlStmtRecorder {
    async fn call(&mut self) -> Result<(), Error> {
        match self.port.prepare(self.query.clone()).await {
            Ok(real) => {
                self.stmt = Some(MockStmt::attached(
                    self.query.clone(),
                    real,
                    self.cassette.clone(),
                ));
            }
            Err(err) => self.err = Some(err),
        }
        Ok(())
    }

    async fn record(&mut self) -> Result<(), Error> {
        let Some(cassette) = self.cassette.clone() else {
            return self.call().await;
        };

        let mut rec = Record::new(RecordKind::SqlStmt, self.query.clone());
        rec.request = self.query.clone();
        rec.id = cassette.add(rec.clone())?;

        let future = self.port.prepare(self.query.clone());
        match spawn_guarded(future).await {
            Ok(Ok(real)) => {
                let stmt = MockStmt::attached(self.query.clone(), real, self.cassette.clone());
                rec.response = serde_json::to_string(&StmtSnapshot {
                    query: stmt.query.clone(),
                    num_input: stmt.num_input,
                })?;
                self.stmt = Some(stmt);
            }
            Ok(Err(err)) => {
                rec.err = Some(err.clone());
                self.err = Some(err);
            }
            Err(payload) => rec.panic = Some(payload),
        }

        let added = cassette.add(rec.clone());
        rec.panic_if_has();
        added.map(|_| ())
    }

    async fn playback(&mut self) -> Result<(), Error> {
        let Some(cassette) = self.cassette.clone() else {
            return Err(Error::PlaybackFailed);
        };

        let rec = cassette
            .get(RecordKind::SqlStmt, &self.query)
            .map_err(|_| Error::PlaybackFailed)?;

        if !rec.response.is_empty() {
            let snapshot: StmtSnapshot =
                serde_json::from_str(&rec.response).map_err(|_| Error::PlaybackFailed)?;
            self.stmt = Some(MockStmt::detached(
                snapshot.query,
                snapshot.num_input,
                self.cassette.clone(),
            ));
        }
        self.err = rec.err.clone();

        rec.panic_if_has();
        if self.stmt.is_none() && self.err.is_none() {
            return Err(Error::PlaybackFailed);
        }
        Ok(())
    }
}
