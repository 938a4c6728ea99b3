use core::ptr::NonNull;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, trace, warn};

use crate::error::{DB_ALREADY_OPEN, Error, Result};
use crate::provider::{FeatureSet, OpenFlags, OpenOptions, Sqlite3Api, Sqlite3Metadata};
use crate::statement::Statement;

use super::hooks::HookSlots;
use super::limits::Limit;

enum Phase<P: Sqlite3Api> {
    Unopened,
    Open(NonNull<P::Db>),
    Closed,
}

/// Registry entry for a statement prepared on this connection.
pub(crate) enum StmtSlot<P: Sqlite3Api> {
    Open(NonNull<P::Stmt>),
    /// Finalized; holds the result of the one native finalize call.
    Closed(Result<()>),
}

pub(crate) struct StatementTable<P: Sqlite3Api> {
    next_id: u64,
    slots: HashMap<u64, StmtSlot<P>>,
}

impl<P: Sqlite3Api> StatementTable<P> {
    fn new() -> Self {
        Self {
            next_id: 0,
            slots: HashMap::new(),
        }
    }

    fn register(&mut self, stmt: NonNull<P::Stmt>) -> u64 {
        self.next_id += 1;
        self.slots.insert(self.next_id, StmtSlot::Open(stmt));
        self.next_id
    }

    /// Raw pointer of a statement that has not been finalized yet.
    pub(crate) fn open_ptr(&self, id: u64) -> Result<NonNull<P::Stmt>> {
        match self.slots.get(&id) {
            Some(StmtSlot::Open(stmt)) => Ok(*stmt),
            _ => Err(Error::stmt_closed()),
        }
    }

    /// Finalize at most once; later calls return the memoized outcome.
    pub(crate) fn finalize(&mut self, api: &P, id: u64) -> Result<()> {
        let Some(slot) = self.slots.get_mut(&id) else {
            return Ok(());
        };
        match slot {
            StmtSlot::Open(stmt) => {
                let result = unsafe { api.finalize(*stmt) };
                *slot = StmtSlot::Closed(result.clone());
                result
            }
            StmtSlot::Closed(result) => result.clone(),
        }
    }

    pub(crate) fn forget(&mut self, id: u64) {
        self.slots.remove(&id);
    }

    fn finalize_all(&mut self, api: &P) -> usize {
        let mut finalized = 0;
        for slot in self.slots.values_mut() {
            if let StmtSlot::Open(stmt) = slot {
                let result = unsafe { api.finalize(*stmt) };
                *slot = StmtSlot::Closed(result);
                finalized += 1;
            }
        }
        finalized
    }
}

/// Everything the connection lock guards.
pub(crate) struct ConnState<P: Sqlite3Api> {
    phase: Phase<P>,
    pub(crate) hooks: HookSlots<P>,
    pub(crate) statements: StatementTable<P>,
}

// Raw handles are only dereferenced by the engine while the lock is held.
unsafe impl<P: Sqlite3Api> Send for ConnState<P> {}

impl<P: Sqlite3Api> ConnState<P> {
    /// Native handle, or the "closed" misuse error when not open.
    pub(crate) fn db(&self) -> Result<NonNull<P::Db>> {
        match &self.phase {
            Phase::Open(db) => Ok(*db),
            Phase::Unopened | Phase::Closed => Err(Error::db_closed()),
        }
    }
}

struct InterruptTarget<P: Sqlite3Api>(NonNull<P::Db>);

// sqlite3_interrupt is safe to call from any thread while the handle is open.
unsafe impl<P: Sqlite3Api> Send for InterruptTarget<P> {}

/// Declared constraints of one result column.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ColumnConstraints {
    /// Column carries `NOT NULL`.
    pub not_null: bool,
    /// Column is part of the primary key.
    pub primary_key: bool,
    /// Column is `AUTOINCREMENT`.
    pub auto_increment: bool,
}

/// Owner of one native connection handle.
///
/// Moves through `unopened -> open -> closed`. Every operation touching the
/// handle, statement operations included, runs under a single state lock.
/// [`Connection::interrupt`] is the one exception: it uses a separate lane so
/// it can reach a connection whose lock is held by a long-running call.
pub struct Connection<'p, P: Sqlite3Api> {
    pub(crate) api: &'p P,
    state: Mutex<ConnState<P>>,
    interrupt_lane: Mutex<Option<InterruptTarget<P>>>,
}

impl<'p, P: Sqlite3Api> Connection<'p, P> {
    /// Unopened connection bound to a provider.
    pub fn new(api: &'p P) -> Self {
        Self {
            api,
            state: Mutex::new(ConnState {
                phase: Phase::Unopened,
                hooks: HookSlots::new(),
                statements: StatementTable::new(),
            }),
            interrupt_lane: Mutex::new(None),
        }
    }

    /// Create and open in one step.
    pub fn connect(api: &'p P, path: &str, flags: OpenFlags) -> Result<Self> {
        let conn = Self::new(api);
        conn.open(path, flags)?;
        Ok(conn)
    }

    /// Provider this connection calls into.
    pub fn api(&self) -> &'p P {
        self.api
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ConnState<P>> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lane(&self) -> MutexGuard<'_, Option<InterruptTarget<P>>> {
        self.interrupt_lane.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Run `op` against the open handle while holding the connection lock.
    pub(crate) fn with_db<T>(&self, op: impl FnOnce(NonNull<P::Db>) -> Result<T>) -> Result<T> {
        let state = self.lock();
        let db = state.db()?;
        op(db)
    }

    /// Open the native handle. A connection can be opened only once.
    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<()> {
        let mut state = self.lock();
        match state.phase {
            Phase::Unopened => {}
            Phase::Open(_) => return Err(Error::misuse(DB_ALREADY_OPEN)),
            Phase::Closed => return Err(Error::db_closed()),
        }
        debug!(path, flags = flags.bits(), "opening database");
        let db = unsafe { self.api.open(path, OpenOptions::new(flags))? };
        if let Err(err) = unsafe { self.api.extended_result_codes(db, true) } {
            if let Err(close_err) = unsafe { self.api.close(db) } {
                warn!(error = %close_err, "close after failed open setup also failed");
            }
            return Err(err);
        }
        state.phase = Phase::Open(db);
        *self.lane() = Some(InterruptTarget(db));
        Ok(())
    }

    /// Whether the native handle is open.
    pub fn is_open(&self) -> bool {
        matches!(self.lock().phase, Phase::Open(_))
    }

    /// Close the native handle.
    ///
    /// Hooks are cleared (progress, busy, commit and rollback, update), open
    /// statements are finalized, then the handle is closed. The connection is
    /// only marked closed once the native close succeeds; after that, further
    /// calls return `Ok(())` without touching the engine.
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock();
        let db = match state.phase {
            Phase::Open(db) => db,
            Phase::Unopened | Phase::Closed => return Ok(()),
        };
        state.hooks.clear_all(self.api, db)?;
        let finalized = state.statements.finalize_all(self.api);
        if finalized > 0 {
            debug!(finalized, "finalized statements left open at close");
        }
        let mut lane = self.lane();
        unsafe { self.api.close(db)? };
        *lane = None;
        state.phase = Phase::Closed;
        debug!("database closed");
        Ok(())
    }

    /// Ask the engine to abort the running operation. Does not take the
    /// connection lock; a no-op when the connection is not open.
    pub fn interrupt(&self) {
        if let Some(target) = self.lane().as_ref() {
            unsafe { self.api.interrupt(target.0) };
        }
    }

    /// Run one or more statements, discarding any rows.
    pub fn exec(&self, sql: &str) -> Result<()> {
        self.with_db(|db| {
            trace!(sql, "exec");
            unsafe { self.api.exec(db, sql) }
        })
    }

    /// Prepare a statement, using prepare_v3 when the engine has it.
    pub fn prepare(&self, sql: &str) -> Result<Statement<'_, 'p, P>> {
        let mut state = self.lock();
        let db = state.db()?;
        trace!(sql, "prepare");
        let stmt = unsafe {
            if self.api.feature_set().contains(FeatureSet::PREPARE_V3) {
                self.api.prepare_v3(db, sql, 0)?
            } else {
                self.api.prepare_v2(db, sql)?
            }
        };
        let id = state.statements.register(stmt);
        Ok(Statement::new(self, id, stmt))
    }

    /// Rows changed by the most recent statement.
    pub fn changes(&self) -> Result<i64> {
        self.with_db(|db| Ok(unsafe { self.api.changes(db) }))
    }

    /// Rows changed since the connection was opened.
    pub fn total_changes(&self) -> Result<i64> {
        self.with_db(|db| Ok(unsafe { self.api.total_changes(db) }))
    }

    /// Engine version string. Needs no open handle.
    pub fn libversion(&self) -> &'static str {
        self.api.libversion()
    }

    /// Set a per-connection limit and return its previous value.
    pub fn limit(&self, limit: Limit, value: i32) -> Result<i32> {
        self.with_db(|db| Ok(unsafe { self.api.limit(db, limit.id(), value) }))
    }

    /// Current value of a per-connection limit.
    pub fn get_limit(&self, limit: Limit) -> Result<i32> {
        self.limit(limit, -1)
    }

    /// Allow or forbid loading extensions on this connection.
    pub fn enable_load_extension(&self, enable: bool) -> Result<()> {
        self.with_db(|db| unsafe { self.api.enable_load_extension(db, enable) })
    }

    /// Process-wide shared cache switch.
    pub fn shared_cache(&self, enable: bool) -> Result<()> {
        self.api.enable_shared_cache(enable)
    }
}

impl<'p, P: Sqlite3Metadata> Connection<'p, P> {
    /// `NOT NULL`, primary key and autoincrement flags for every result column
    /// of `stmt`. Columns without a table origin report no constraints.
    pub fn column_metadata(&self, stmt: &Statement<'_, 'p, P>) -> Result<Vec<ColumnConstraints>> {
        if !core::ptr::eq(stmt.conn, self) {
            return Err(Error::misuse("statement belongs to another connection"));
        }
        stmt.safe_run(|api, db, raw| {
            let count = unsafe { api.column_count(raw) };
            let mut columns = Vec::with_capacity(count.max(0) as usize);
            for col in 0..count {
                let table = unsafe { api.column_table_name(raw, col) }
                    .and_then(|name| unsafe { name.as_str() });
                let origin = unsafe { api.column_origin_name(raw, col) }
                    .and_then(|name| unsafe { name.as_str() });
                let constraints = match (table, origin) {
                    (Some(table), Some(origin)) => {
                        unsafe { api.table_column_metadata(db, None, table, origin) }
                            .map(|md| ColumnConstraints {
                                not_null: md.not_null,
                                primary_key: md.primary_key,
                                auto_increment: md.autoinc,
                            })
                            .unwrap_or_default()
                    }
                    _ => ColumnConstraints::default(),
                };
                columns.push(constraints);
            }
            Ok(columns)
        })
    }
}

impl<P: Sqlite3Api> Drop for Connection<'_, P> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "failed to close connection on drop");
        }
    }
}
