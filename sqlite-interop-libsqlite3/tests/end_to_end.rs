use sqlite_interop::{
    AggregateFunction, Args, BackupConfig, BackupObserver, BackupStatus, Connection, Context,
    ErrorCode, FeatureSet, Function, FunctionFlags, Limit, OpenFlags, Result, Sqlite3Api,
    StepResult, UpdateKind, Value, WindowFunction,
};
use sqlite_interop_libsqlite3::LibSqlite3;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Conn = Connection<'static, LibSqlite3>;
type Routine = Function<LibSqlite3>;

fn api() -> Option<&'static LibSqlite3> {
    match LibSqlite3::load() {
        Ok(api) => Some(api),
        Err(err) => {
            eprintln!("skipping libsqlite3 test: {err}");
            None
        }
    }
}

fn memory_db(api: &'static LibSqlite3) -> Conn {
    Connection::connect(api, ":memory:", OpenFlags::read_write_create()).unwrap()
}

fn query_i64(conn: &Conn, sql: &str) -> i64 {
    let stmt = conn.prepare(sql).unwrap();
    assert_eq!(stmt.step().unwrap(), StepResult::Row);
    stmt.column_int64(0).unwrap()
}

fn fill_numbers(conn: &Conn, rows: i64) {
    conn.exec("CREATE TABLE nums(id INTEGER PRIMARY KEY, v INTEGER, label TEXT)")
        .unwrap();
    conn.exec("BEGIN").unwrap();
    let insert = conn
        .prepare("INSERT INTO nums(v, label) VALUES(?1, ?2)")
        .unwrap();
    for v in 0..rows {
        insert.bind_int64(1, v).unwrap();
        insert.bind_text(2, &format!("row-{v}")).unwrap();
        assert_eq!(insert.step().unwrap(), StepResult::Done);
        insert.reset().unwrap();
    }
    conn.exec("COMMIT").unwrap();
}

fn dump_numbers(conn: &Conn) -> Vec<(i64, i64, Option<String>)> {
    let stmt = conn.prepare("SELECT id, v, label FROM nums ORDER BY id").unwrap();
    let mut rows = Vec::new();
    while stmt.step().unwrap() == StepResult::Row {
        rows.push((
            stmt.column_int64(0).unwrap(),
            stmt.column_int64(1).unwrap(),
            stmt.column_text(2).unwrap(),
        ));
    }
    rows
}

#[derive(Default)]
struct SumSquares(i64);

impl AggregateFunction<LibSqlite3> for SumSquares {
    fn step(&mut self, _ctx: &Context<'_, LibSqlite3>, args: &Args<'_, LibSqlite3>) -> Result<()> {
        let v = args.int64(0)?;
        if v < 0 {
            return Err(sqlite_interop::Error::misuse("negative input"));
        }
        self.0 += v * v;
        Ok(())
    }

    fn finalize(&mut self, _ctx: &Context<'_, LibSqlite3>) -> Result<Value> {
        Ok(Value::Integer(self.0))
    }
}

#[derive(Default)]
struct MovingSum(i64);

impl AggregateFunction<LibSqlite3> for MovingSum {
    fn step(&mut self, _ctx: &Context<'_, LibSqlite3>, args: &Args<'_, LibSqlite3>) -> Result<()> {
        self.0 += args.int64(0)?;
        Ok(())
    }

    fn finalize(&mut self, _ctx: &Context<'_, LibSqlite3>) -> Result<Value> {
        Ok(Value::Integer(self.0))
    }
}

impl WindowFunction<LibSqlite3> for MovingSum {
    fn inverse(
        &mut self,
        _ctx: &Context<'_, LibSqlite3>,
        args: &Args<'_, LibSqlite3>,
    ) -> Result<()> {
        self.0 -= args.int64(0)?;
        Ok(())
    }

    fn value(&mut self, _ctx: &Context<'_, LibSqlite3>) -> Result<Value> {
        Ok(Value::Integer(self.0))
    }
}

#[test]
fn statement_round_trip() {
    let Some(api) = api() else { return };
    let conn = memory_db(api);
    conn.exec("CREATE TABLE t(i INTEGER, f REAL, s TEXT, b BLOB, n)")
        .unwrap();
    let insert = conn.prepare("INSERT INTO t VALUES(?, ?, ?, ?, ?)").unwrap();
    assert_eq!(insert.bind_parameter_count().unwrap(), 5);
    insert.bind_int64(1, i64::MAX).unwrap();
    insert.bind_double(2, 2.5).unwrap();
    insert.bind_text(3, "a\0b").unwrap();
    insert.bind_blob(4, &[]).unwrap();
    insert.bind_null(5).unwrap();
    assert_eq!(insert.step().unwrap(), StepResult::Done);
    assert_eq!(conn.changes().unwrap(), 1);

    let select = conn.prepare("SELECT i, f, s, b, n FROM t").unwrap();
    assert_eq!(select.step().unwrap(), StepResult::Row);
    assert_eq!(select.column_count().unwrap(), 5);
    assert_eq!(select.column_name(2).unwrap().as_deref(), Some("s"));
    assert_eq!(select.column_decltype(1).unwrap().as_deref(), Some("REAL"));
    assert_eq!(select.column_int64(0).unwrap(), i64::MAX);
    assert_eq!(select.column_double(1).unwrap(), 2.5);
    assert_eq!(select.column_text(2).unwrap().as_deref(), Some("a\0b"));
    assert_eq!(select.column_blob(3).unwrap(), Some(Vec::new()));
    assert_eq!(select.column_value(4).unwrap(), Value::Null);
    assert_eq!(select.column_text(4).unwrap(), None);
    assert_eq!(select.step().unwrap(), StepResult::Done);
}

#[test]
fn engine_errors_carry_messages() {
    let Some(api) = api() else { return };
    let conn = memory_db(api);
    let err = conn.prepare("SELECT * FROM missing").unwrap_err();
    assert_eq!(err.code, ErrorCode::Error);
    assert!(err.to_string().contains("no such table"), "{err}");

    conn.exec("CREATE TABLE u(x UNIQUE)").unwrap();
    conn.exec("INSERT INTO u VALUES(1)").unwrap();
    let err = conn.exec("INSERT INTO u VALUES(1)").unwrap_err();
    assert_eq!(err.code, ErrorCode::Constraint);
    // SQLITE_CONSTRAINT_UNIQUE
    assert_eq!(err.extended, Some(2067));
}

#[test]
fn lifecycle_rules() {
    let Some(api) = api() else { return };
    let conn = memory_db(api);
    let err = conn.open(":memory:", OpenFlags::read_write_create()).unwrap_err();
    assert_eq!(err.to_string(), "DB already open");

    let stmt = conn.prepare("SELECT 1").unwrap();
    stmt.close().unwrap();
    stmt.close().unwrap();
    assert!(stmt.is_closed());
    assert_eq!(stmt.step().unwrap_err().to_string(), "stmt pointer is closed");

    let pending = conn.prepare("SELECT 2").unwrap();
    conn.close().unwrap();
    conn.close().unwrap();
    assert!(!conn.is_open());
    assert_eq!(
        pending.step().unwrap_err().to_string(),
        "The database has been closed"
    );
    assert_eq!(conn.exec("SELECT 1").unwrap_err().code, ErrorCode::Misuse);
    let err = conn.open(":memory:", OpenFlags::read_write_create()).unwrap_err();
    assert_eq!(err.to_string(), "The database has been closed");
}

#[test]
fn scalar_functions_and_errors() {
    let Some(api) = api() else { return };
    let conn = memory_db(api);
    conn.create_function(
        "shout",
        1,
        FunctionFlags::DETERMINISTIC,
        Routine::scalar(|_ctx, args| Ok(Value::from(args.text(0)?.map(|s| s.to_uppercase())))),
    )
    .unwrap();
    conn.create_function(
        "fail",
        0,
        FunctionFlags::empty(),
        Routine::scalar(|_ctx, _args| Err(sqlite_interop::Error::misuse("nope"))),
    )
    .unwrap();
    conn.create_function(
        "boom",
        0,
        FunctionFlags::empty(),
        Routine::scalar(|_ctx, _args| panic!("kaboom")),
    )
    .unwrap();

    let stmt = conn.prepare("SELECT shout('abc'), shout(NULL)").unwrap();
    assert_eq!(stmt.step().unwrap(), StepResult::Row);
    assert_eq!(stmt.column_text(0).unwrap().as_deref(), Some("ABC"));
    assert_eq!(stmt.column_value(1).unwrap(), Value::Null);
    drop(stmt);

    let err = conn.prepare("SELECT fail()").unwrap().step().unwrap_err();
    assert_eq!(err.to_string(), "nope");
    let err = conn.prepare("SELECT boom()").unwrap().step().unwrap_err();
    assert!(err.to_string().contains("boom"), "{err}");
    assert_eq!(query_i64(&conn, "SELECT 41 + 1"), 42);

    conn.destroy_function("shout").unwrap();
    conn.create_function(
        "shout",
        -1,
        FunctionFlags::empty(),
        Routine::scalar(|_ctx, args| Ok(Value::Integer(args.len() as i64))),
    )
    .unwrap();
    assert_eq!(query_i64(&conn, "SELECT shout(1, 2, 3)"), 3);
}

#[test]
fn aggregate_step_error_leaves_connection_usable() {
    let Some(api) = api() else { return };
    let conn = memory_db(api);
    conn.create_function(
        "sum_sq",
        1,
        FunctionFlags::empty(),
        Routine::aggregate(SumSquares::default),
    )
    .unwrap();
    conn.exec("CREATE TABLE t(x INTEGER); INSERT INTO t VALUES(1),(2),(3)")
        .unwrap();
    assert_eq!(query_i64(&conn, "SELECT sum_sq(x) FROM t"), 14);
    assert_eq!(query_i64(&conn, "SELECT sum_sq(x) FROM t WHERE 0"), 0);

    conn.exec("INSERT INTO t VALUES(-1)").unwrap();
    let err = conn
        .prepare("SELECT sum_sq(x) FROM t")
        .unwrap()
        .step()
        .unwrap_err();
    assert_eq!(err.to_string(), "negative input");

    assert_eq!(query_i64(&conn, "SELECT sum_sq(x) FROM t WHERE x > 0"), 14);
    conn.exec("DELETE FROM t WHERE x < 0").unwrap();
}

#[test]
fn window_function_slides() {
    let Some(api) = api() else { return };
    if !api.feature_set().contains(FeatureSet::WINDOW_FUNCTIONS) {
        return;
    }
    let conn = memory_db(api);
    conn.create_function(
        "moving_sum",
        1,
        FunctionFlags::empty(),
        Routine::window(MovingSum::default),
    )
    .unwrap();
    conn.exec("CREATE TABLE t(x INTEGER); INSERT INTO t VALUES(1),(2),(3),(4)")
        .unwrap();
    let stmt = conn
        .prepare(
            "SELECT moving_sum(x) OVER (ORDER BY x ROWS BETWEEN 1 PRECEDING AND CURRENT ROW) \
             FROM t ORDER BY x",
        )
        .unwrap();
    let mut sums = Vec::new();
    while stmt.step().unwrap() == StepResult::Row {
        sums.push(stmt.column_int64(0).unwrap());
    }
    assert_eq!(sums, vec![1, 3, 5, 7]);
}

#[test]
fn collation_orders_rows() {
    let Some(api) = api() else { return };
    let conn = memory_db(api);
    conn.create_collation("by_len", |a: &str, b: &str| {
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    })
    .unwrap();
    conn.exec("CREATE TABLE w(s TEXT); INSERT INTO w VALUES('ccc'),('a'),('bb')")
        .unwrap();
    let stmt = conn.prepare("SELECT s FROM w ORDER BY s COLLATE by_len").unwrap();
    let mut rows = Vec::new();
    while stmt.step().unwrap() == StepResult::Row {
        rows.push(stmt.column_text(0).unwrap().unwrap_or_default());
    }
    assert_eq!(rows, ["a", "bb", "ccc"]);
    drop(stmt);

    conn.destroy_collation("by_len").unwrap();
    let err = conn
        .prepare("SELECT s FROM w ORDER BY s COLLATE by_len")
        .unwrap_err();
    assert!(err.to_string().contains("no such collation"), "{err}");
    assert_eq!(
        conn.create_collation("", |a: &str, b: &str| a.cmp(b))
            .unwrap_err()
            .to_string(),
        "invalid function name: ''"
    );
}

#[test]
fn hooks_observe_changes() {
    let Some(api) = api() else { return };
    let conn = memory_db(api);
    conn.exec("CREATE TABLE h(x)").unwrap();

    let updates = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&updates);
    conn.set_update_listener(move |kind: UpdateKind, db: &str, table: &str, rowid: i64| {
        seen.lock()
            .unwrap()
            .push((kind, db.to_owned(), table.to_owned(), rowid));
    })
    .unwrap();

    let commits = Arc::new(Mutex::new(Vec::new()));
    let outcomes = Arc::clone(&commits);
    conn.set_commit_listener(move |committed: bool| outcomes.lock().unwrap().push(committed))
        .unwrap();

    conn.exec("INSERT INTO h VALUES(1)").unwrap();
    conn.exec("UPDATE h SET x = 2 WHERE rowid = 1").unwrap();
    conn.exec("BEGIN; DELETE FROM h WHERE x = 2; ROLLBACK").unwrap();

    assert_eq!(
        *updates.lock().unwrap(),
        vec![
            (UpdateKind::Insert, "main".to_owned(), "h".to_owned(), 1),
            (UpdateKind::Update, "main".to_owned(), "h".to_owned(), 1),
            (UpdateKind::Delete, "main".to_owned(), "h".to_owned(), 1),
        ]
    );
    assert_eq!(*commits.lock().unwrap(), vec![true, true, false]);

    conn.clear_update_listener().unwrap();
    conn.clear_commit_listener().unwrap();
    conn.exec("INSERT INTO h VALUES(3)").unwrap();
    assert_eq!(updates.lock().unwrap().len(), 3);
    assert_eq!(commits.lock().unwrap().len(), 3);
}

#[test]
fn progress_handler_aborts_long_queries() {
    let Some(api) = api() else { return };
    let conn = memory_db(api);
    conn.set_progress_handler(100, || true).unwrap();
    let err = conn
        .exec("WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT count(*) FROM c")
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Interrupt);
    conn.clear_progress_handler().unwrap();
    assert_eq!(query_i64(&conn, "SELECT 7"), 7);
}

#[test]
fn interrupt_reaches_a_busy_connection() {
    let Some(api) = api() else { return };
    let conn = memory_db(api);
    let finished = AtomicBool::new(false);
    let err = std::thread::scope(|scope| {
        scope.spawn(|| {
            while !finished.load(AtomicOrdering::SeqCst) {
                std::thread::sleep(Duration::from_millis(10));
                conn.interrupt();
            }
        });
        let out = conn.exec(
            "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT count(*) FROM c",
        );
        finished.store(true, AtomicOrdering::SeqCst);
        out
    })
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::Interrupt);
}

#[test]
fn busy_handler_is_consulted() {
    let Some(api) = api() else { return };
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("busy.db");
    let path = path.to_str().unwrap();
    let writer = Connection::connect(api, path, OpenFlags::read_write_create()).unwrap();
    let other = Connection::connect(api, path, OpenFlags::read_write_create()).unwrap();
    writer.exec("CREATE TABLE t(x)").unwrap();
    writer.exec("BEGIN IMMEDIATE").unwrap();

    let attempts = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&attempts);
    other
        .set_busy_handler(move |n: i32| {
            seen.lock().unwrap().push(n);
            n < 2
        })
        .unwrap();
    let err = other.exec("INSERT INTO t VALUES(1)").unwrap_err();
    assert_eq!(err.code, ErrorCode::Busy);
    let attempts = attempts.lock().unwrap().clone();
    assert_eq!(attempts.first(), Some(&0));
    assert_eq!(attempts.last(), Some(&2));

    other.busy_timeout(0).unwrap();
    writer.exec("COMMIT").unwrap();
    other.exec("INSERT INTO t VALUES(1)").unwrap();
}

#[test]
fn backup_and_restore_copy_every_row() {
    let Some(api) = api() else { return };
    if !api.feature_set().contains(FeatureSet::BACKUP) {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("copy.db");
    let dest = dest.to_str().unwrap();

    let source = memory_db(api);
    fill_numbers(&source, 1000);

    let mut reports = Vec::new();
    let mut observer = |remaining: i32, pages: i32| reports.push((remaining, pages));
    let config = BackupConfig::default().with_pages_per_step(2);
    let status = source
        .backup("main", dest, Some(&mut observer as &mut dyn BackupObserver), &config)
        .unwrap();
    assert_eq!(status, BackupStatus::Done);
    assert!(reports.len() > 1);
    assert_eq!(reports.last().map(|r| r.0), Some(0));

    let copy = Connection::connect(api, dest, OpenFlags::READ_ONLY).unwrap();
    assert_eq!(query_i64(&copy, "SELECT count(*) FROM nums"), 1000);
    assert_eq!(query_i64(&copy, "SELECT sum(v) FROM nums"), 499_500);

    let restored = memory_db(api);
    let status = restored
        .restore("main", dest, None, &BackupConfig::default())
        .unwrap();
    assert_eq!(status, BackupStatus::Done);
    let expected = dump_numbers(&source);
    assert_eq!(expected.len(), 1000);
    assert_eq!(dump_numbers(&copy), expected);
    assert_eq!(dump_numbers(&restored), expected);
    assert_eq!(query_i64(&restored, "SELECT sum(v) FROM nums"), 499_500);
}

#[test]
fn restore_from_missing_file_fails() {
    let Some(api) = api() else { return };
    if !api.feature_set().contains(FeatureSet::BACKUP) {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.db");
    let conn = memory_db(api);
    let err = conn
        .restore("main", missing.to_str().unwrap(), None, &BackupConfig::default())
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::CantOpen);
}

#[test]
fn restore_step_failure_carries_a_message() {
    let Some(api) = api() else { return };
    if !api.feature_set().contains(FeatureSet::BACKUP) {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("small-pages.db");
    let source_path = source_path.to_str().unwrap();
    let source = Connection::connect(api, source_path, OpenFlags::read_write_create()).unwrap();
    source.exec("PRAGMA page_size = 1024").unwrap();
    fill_numbers(&source, 10);
    source.close().unwrap();

    // A WAL destination cannot take pages of a different size.
    let dest_path = dir.path().join("wal.db");
    let dest = Connection::connect(api, dest_path.to_str().unwrap(), OpenFlags::read_write_create())
        .unwrap();
    dest.exec("PRAGMA page_size = 4096").unwrap();
    dest.exec("PRAGMA journal_mode = WAL").unwrap();
    dest.exec("CREATE TABLE kept(x)").unwrap();

    let err = dest
        .restore("main", source_path, None, &BackupConfig::default())
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ReadOnly);
    assert!(err.message.as_deref().is_some_and(|m| !m.is_empty()));
    assert_eq!(query_i64(&dest, "SELECT count(*) FROM kept"), 0);
}

#[test]
fn serialize_then_deserialize() {
    let Some(api) = api() else { return };
    if !api.feature_set().contains(FeatureSet::SERIALIZE) {
        return;
    }
    let source = memory_db(api);
    fill_numbers(&source, 250);
    let image = source.serialize("main").unwrap();
    assert!(!image.is_empty());
    assert_eq!(&image[..16], b"SQLite format 3\0");

    let target = memory_db(api);
    target.deserialize("main", &image).unwrap();
    let expected = dump_numbers(&source);
    assert_eq!(expected.len(), 250);
    assert_eq!(dump_numbers(&target), expected);
    assert_eq!(
        query_i64(&target, "SELECT sum(v) FROM nums"),
        query_i64(&source, "SELECT sum(v) FROM nums")
    );
    // The adopted buffer is resizeable.
    target
        .exec("INSERT INTO nums(v, label) SELECT v, label FROM nums")
        .unwrap();
    assert_eq!(query_i64(&target, "SELECT count(*) FROM nums"), 500);
    assert!(target.serialize("main").unwrap().len() > image.len());
}

#[test]
fn limits_and_counters() {
    let Some(api) = api() else { return };
    let conn = memory_db(api);
    conn.exec("CREATE TABLE t(s)").unwrap();
    let previous = conn.limit(Limit::Length, 1000).unwrap();
    assert!(previous > 1000);
    assert_eq!(conn.get_limit(Limit::Length).unwrap(), 1000);

    let insert = conn.prepare("INSERT INTO t VALUES(?)").unwrap();
    let err = insert.bind_text(1, &"x".repeat(2000)).unwrap_err();
    assert_eq!(err.code, ErrorCode::TooBig);
    insert.bind_text(1, "short").unwrap();
    assert_eq!(insert.step().unwrap(), StepResult::Done);
    insert.reset().unwrap();
    insert.clear_bindings().unwrap();
    assert_eq!(insert.step().unwrap(), StepResult::Done);

    assert_eq!(conn.total_changes().unwrap(), 2);
    assert!(conn.libversion().starts_with('3'));
}

#[test]
fn column_metadata_reports_constraints() {
    let Some(api) = api() else { return };
    if !api.feature_set().contains(FeatureSet::COLUMN_METADATA) {
        return;
    }
    let conn = memory_db(api);
    conn.exec("CREATE TABLE m(id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL, note)")
        .unwrap();
    let stmt = conn.prepare("SELECT id, name, note, 1 FROM m").unwrap();
    let columns = conn.column_metadata(&stmt).unwrap();
    assert_eq!(columns.len(), 4);
    assert!(columns[0].primary_key && columns[0].auto_increment);
    assert!(columns[1].not_null && !columns[1].primary_key);
    assert!(!columns[2].not_null);
    assert_eq!(columns[3], Default::default());
    assert_eq!(stmt.column_table_name(1).unwrap().as_deref(), Some("m"));
    assert_eq!(stmt.column_table_name(3).unwrap(), None);
}
