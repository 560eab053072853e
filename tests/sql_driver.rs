//! Exercises the SQL ports against a real driver: rusqlite backs the ports
//! during the record pass, then the wiped database proves replay never
//! reaches it.

use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use tapedeck::{
    context::Context,
    errors::{Error, RecordedError},
    mode::Mode,
    recorder::BoxFuture,
    registry::Registry,
    sql::{self, ExecOutcome, ExecPort, MockRows, PreparedStmt, RowsPort, SqlRows, SqlValue, StmtPort},
};

#[derive(Clone)]
struct SqliteDb {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDb {
    fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }
}

fn recorded_err(err: rusqlite::Error) -> RecordedError {
    RecordedError::new(err.to_string())
}

fn to_sqlite(value: SqlValue) -> rusqlite::types::Value {
    use rusqlite::types::Value;
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Int(v) => Value::Integer(v),
        SqlValue::Float(v) => Value::Real(v),
        SqlValue::Bool(v) => Value::Integer(v as i64),
        SqlValue::Text(v) => Value::Text(v),
        SqlValue::Bytes(v) => Value::Blob(v),
        SqlValue::Time(v) => Value::Text(v.to_rfc3339()),
        SqlValue::List(_) => Value::Null,
    }
}

fn from_sqlite(value: rusqlite::types::Value) -> SqlValue {
    use rusqlite::types::Value;
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(v) => SqlValue::Int(v),
        Value::Real(v) => SqlValue::Float(v),
        Value::Text(v) => SqlValue::Text(v),
        Value::Blob(v) => SqlValue::Bytes(v),
    }
}

fn blocking_query(
    conn: &Arc<Mutex<Connection>>,
    query: &str,
    args: Vec<SqlValue>,
) -> Result<Box<dyn SqlRows>, RecordedError> {
    let conn = conn.lock().expect("connection lock poisoned");
    let mut stmt = conn.prepare(query).map_err(recorded_err)?;
    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(str::to_owned)
        .collect();
    let column_count = columns.len();

    let params: Vec<rusqlite::types::Value> = args.into_iter().map(to_sqlite).collect();
    let mut rows = stmt
        .query(rusqlite::params_from_iter(params))
        .map_err(recorded_err)?;

    let mut values = Vec::new();
    while let Some(row) = rows.next().map_err(recorded_err)? {
        let mut out = Vec::with_capacity(column_count);
        for idx in 0..column_count {
            let cell: rusqlite::types::Value = row.get(idx).map_err(recorded_err)?;
            out.push(from_sqlite(cell));
        }
        values.push(out);
    }
    Ok(Box::new(MockRows::new(columns, values)))
}

impl RowsPort for SqliteDb {
    fn query(
        &self,
        query: String,
        args: Vec<SqlValue>,
    ) -> BoxFuture<Result<Box<dyn SqlRows>, RecordedError>> {
        let conn = Arc::clone(&self.conn);
        Box::pin(async move { blocking_query(&conn, &query, args) })
    }
}

impl ExecPort for SqliteDb {
    fn exec(
        &self,
        query: String,
        args: Vec<SqlValue>,
    ) -> BoxFuture<Result<ExecOutcome, RecordedError>> {
        let conn = Arc::clone(&self.conn);
        Box::pin(async move {
            let conn = conn.lock().expect("connection lock poisoned");
            let params: Vec<rusqlite::types::Value> = args.into_iter().map(to_sqlite).collect();
            let changed = conn
                .execute(&query, rusqlite::params_from_iter(params))
                .map_err(recorded_err)?;
            Ok(ExecOutcome {
                last_insert_id: Ok(conn.last_insert_rowid()),
                rows_affected: Ok(changed as i64),
            })
        })
    }
}

struct SqliteStmt {
    db: SqliteDb,
    query: String,
    num_input: i64,
}

impl PreparedStmt for SqliteStmt {
    fn num_input(&self) -> i64 {
        self.num_input
    }

    fn exec(&self, args: Vec<SqlValue>) -> BoxFuture<Result<ExecOutcome, RecordedError>> {
        ExecPort::exec(&self.db, self.query.clone(), args)
    }

    fn query(&self, args: Vec<SqlValue>) -> BoxFuture<Result<Box<dyn SqlRows>, RecordedError>> {
        RowsPort::query(&self.db, self.query.clone(), args)
    }
}

impl StmtPort for SqliteDb {
    fn prepare(&self, query: String) -> BoxFuture<Result<Arc<dyn PreparedStmt>, RecordedError>> {
        let db = self.clone();
        Box::pin(async move {
            let num_input = {
                let conn = db.conn.lock().expect("connection lock poisoned");
                let stmt = conn.prepare(&query).map_err(recorded_err)?;
                stmt.parameter_count() as i64
            };
            Ok(Arc::new(SqliteStmt {
                db: db.clone(),
                query,
                num_input,
            }) as Arc<dyn PreparedStmt>)
        })
    }
}

fn seeded_db() -> SqliteDb {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        r#"
        CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, avatar BLOB, age INTEGER);
        INSERT INTO users (id, name, avatar, age) VALUES (1, 'ada', x'706e67', 36);
        INSERT INTO users (id, name, avatar, age) VALUES (2, 'bob', NULL, NULL);
        "#,
    )
    .unwrap();
    SqliteDb::new(conn)
}

#[tokio::test]
async fn sqlite_rows_exec_and_stmt_record_then_replay() {
    let db = seeded_db();
    let rows_port: Arc<dyn RowsPort> = Arc::new(db.clone());
    let exec_port: Arc<dyn ExecPort> = Arc::new(db.clone());
    let stmt_port: Arc<dyn StmtPort> = Arc::new(db.clone());

    let registry = Registry::builder().default_mode(Mode::Record).build();
    let cassette = registry.new_cassette().unwrap();
    let ctx = Context::with_cassette(cassette.clone());

    let select = "SELECT id, name, avatar FROM users ORDER BY id";
    let expected_rows = vec![
        vec![
            SqlValue::Int(1),
            SqlValue::Text("ada".into()),
            SqlValue::Bytes(b"png".to_vec()),
        ],
        vec![SqlValue::Int(2), SqlValue::Text("bob".into()), SqlValue::Null],
    ];

    let mut rows = sql::query(&ctx, &rows_port, select, vec![]).await.unwrap();
    assert_eq!(rows.columns(), vec!["id", "name", "avatar"]);
    assert_eq!(rows.next_row(), Some(expected_rows[0].clone()));
    assert_eq!(rows.next_row(), Some(expected_rows[1].clone()));
    assert_eq!(rows.next_row(), None);

    let update = "UPDATE users SET age = age + 1 WHERE age IS NOT NULL";
    let result = sql::exec(&ctx, &exec_port, update, vec![]).await.unwrap();
    assert_eq!(result.rows_affected().unwrap(), 1);

    let by_id = "SELECT name FROM users WHERE id = ?";
    let stmt = sql::prepare(&ctx, &stmt_port, by_id).await.unwrap();
    assert_eq!(stmt.num_input(), 1);
    let mut stmt_rows = stmt.query(vec![SqlValue::Int(1)]).await.unwrap();
    assert_eq!(stmt_rows.next_row(), Some(vec![SqlValue::Text("ada".into())]));
    assert_eq!(stmt_rows.next_row(), None);

    // Wipe the database: replay must satisfy everything from the cassette.
    db.conn
        .lock()
        .unwrap()
        .execute_batch("DELETE FROM users")
        .unwrap();

    cassette.set_mode(Mode::Playback).rewind();

    let mut rows = sql::query(&ctx, &rows_port, select, vec![]).await.unwrap();
    assert_eq!(rows.columns(), vec!["id", "name", "avatar"]);
    assert_eq!(rows.next_row(), Some(expected_rows[0].clone()));
    assert_eq!(rows.next_row(), Some(expected_rows[1].clone()));
    assert_eq!(rows.next_row(), None);

    let result = sql::exec(&ctx, &exec_port, update, vec![]).await.unwrap();
    assert_eq!(result.rows_affected().unwrap(), 1);

    let stmt = sql::prepare(&ctx, &stmt_port, by_id).await.unwrap();
    assert_eq!(stmt.num_input(), 1);
    let mut stmt_rows = stmt.query(vec![SqlValue::Int(1)]).await.unwrap();
    assert_eq!(stmt_rows.next_row(), Some(vec![SqlValue::Text("ada".into())]));

    assert!(cassette.is_playback_succeeded());
}

#[tokio::test]
async fn replayed_cassette_file_satisfies_queries_in_another_process_shape() {
    let db = seeded_db();
    let rows_port: Arc<dyn RowsPort> = Arc::new(db.clone());

    let registry = Registry::builder()
        .default_mode(Mode::Record)
        .with_file(true)
        .build();
    let cassette = registry.new_cassette().unwrap();
    let ctx = Context::with_cassette(cassette.clone());

    let select = "SELECT name FROM users ORDER BY id";
    let mut rows = sql::query(&ctx, &rows_port, select, vec![]).await.unwrap();
    assert_eq!(rows.next_row(), Some(vec![SqlValue::Text("ada".into())]));
    let path = cassette.path_name();
    cassette.finalize().unwrap();

    // A different registry, no database at all.
    let other = Registry::new();
    let loaded = other.cassette_from_file(&path).unwrap();
    let ctx = Context::with_cassette(loaded.clone());
    let empty_db: Arc<dyn RowsPort> = Arc::new(SqliteDb::new(Connection::open_in_memory().unwrap()));

    let mut rows = sql::query(&ctx, &empty_db, select, vec![]).await.unwrap();
    assert_eq!(rows.next_row(), Some(vec![SqlValue::Text("ada".into())]));
    assert_eq!(rows.next_row(), Some(vec![SqlValue::Text("bob".into())]));

    std::fs::remove_file(&path).ok();
}

#[tokio::test]
async fn driver_error_is_captured_and_replayed() {
    let db = seeded_db();
    let rows_port: Arc<dyn RowsPort> = Arc::new(db.clone());

    let registry = Registry::builder().default_mode(Mode::Record).build();
    let cassette = registry.new_cassette().unwrap();
    let ctx = Context::with_cassette(cassette.clone());

    let bad = "SELECT * FROM missing_table";
    let recorded = sql::query(&ctx, &rows_port, bad, vec![]).await.unwrap_err();
    let Error::Captured(recorded) = recorded else {
        panic!("expected a captured driver error, got {recorded:?}");
    };

    cassette.set_mode(Mode::Playback).rewind();
    let replayed = sql::query(&ctx, &rows_port, bad, vec![]).await.unwrap_err();
    assert_eq!(replayed, Error::Captured(recorded));
}
