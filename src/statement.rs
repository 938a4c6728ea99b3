use core::hash::{Hash, Hasher};
use core::ptr::NonNull;

use tracing::warn;

use crate::Connection;
use crate::error::{Error, Result};
use crate::marshal::{decode_blob, decode_text};
use crate::provider::{
    FeatureSet, RawBytes, Sqlite3Api, Sqlite3Metadata, StepResult, ValueType,
};
use crate::value::Value;

/// Prepared statement guarded by its connection's lock.
///
/// Every native call on the statement goes through [`Statement::safe_run`],
/// which takes the connection lock and checks that neither the connection
/// nor the statement has been closed. Finalize runs at most once.
pub struct Statement<'c, 'p, P: Sqlite3Api> {
    pub(crate) conn: &'c Connection<'p, P>,
    id: u64,
    // Identity only; dereferenced through the registry under the lock.
    ptr: NonNull<P::Stmt>,
}

// All access to the native pointer is serialized by the connection lock.
unsafe impl<P: Sqlite3Api> Send for Statement<'_, '_, P> {}
unsafe impl<P: Sqlite3Api> Sync for Statement<'_, '_, P> {}

impl<'c, 'p, P: Sqlite3Api> Statement<'c, 'p, P> {
    pub(crate) fn new(conn: &'c Connection<'p, P>, id: u64, ptr: NonNull<P::Stmt>) -> Self {
        Self { conn, id, ptr }
    }

    /// Connection that owns this statement.
    pub fn connection(&self) -> &'c Connection<'p, P> {
        self.conn
    }

    /// Run `op` on the raw handles under the connection lock.
    ///
    /// Fails with the "closed" error when the connection or the statement is
    /// closed, without calling `op`.
    pub fn safe_run<T>(
        &self,
        op: impl FnOnce(&'p P, NonNull<P::Db>, NonNull<P::Stmt>) -> Result<T>,
    ) -> Result<T> {
        let state = self.conn.lock();
        let db = state.db()?;
        let stmt = state.statements.open_ptr(self.id)?;
        op(self.conn.api, db, stmt)
    }

    /// Finalize the statement. Later calls return the first outcome.
    pub fn close(&self) -> Result<()> {
        let mut state = self.conn.lock();
        state.statements.finalize(self.conn.api, self.id)
    }

    /// Whether the statement has been finalized.
    pub fn is_closed(&self) -> bool {
        self.conn.lock().statements.open_ptr(self.id).is_err()
    }

    /// Advance to the next row.
    pub fn step(&self) -> Result<StepResult> {
        self.safe_run(|api, _, stmt| unsafe { api.step(stmt) })
    }

    /// Rewind so the statement can run again. Bindings are kept.
    pub fn reset(&self) -> Result<()> {
        self.safe_run(|api, _, stmt| unsafe { api.reset(stmt) })
    }

    /// Reset every bound parameter to NULL.
    pub fn clear_bindings(&self) -> Result<()> {
        self.safe_run(|api, _, stmt| unsafe { api.clear_bindings(stmt) })
    }

    /// Number of SQL parameters.
    pub fn bind_parameter_count(&self) -> Result<i32> {
        self.safe_run(|api, _, stmt| Ok(unsafe { api.bind_parameter_count(stmt) }))
    }

    /// Bind NULL at 1-based parameter `idx`.
    pub fn bind_null(&self, idx: i32) -> Result<()> {
        self.safe_run(|api, _, stmt| unsafe { api.bind_null(stmt, idx) })
    }

    /// Bind a 32-bit integer.
    pub fn bind_int(&self, idx: i32, value: i32) -> Result<()> {
        self.safe_run(|api, _, stmt| unsafe { api.bind_int(stmt, idx, value) })
    }

    /// Bind a 64-bit integer.
    pub fn bind_int64(&self, idx: i32, value: i64) -> Result<()> {
        self.safe_run(|api, _, stmt| unsafe { api.bind_int64(stmt, idx, value) })
    }

    /// Bind a double.
    pub fn bind_double(&self, idx: i32, value: f64) -> Result<()> {
        self.safe_run(|api, _, stmt| unsafe { api.bind_double(stmt, idx, value) })
    }

    /// Bind text.
    pub fn bind_text(&self, idx: i32, value: &str) -> Result<()> {
        self.safe_run(|api, _, stmt| unsafe { api.bind_text(stmt, idx, value) })
    }

    /// Bind bytes.
    pub fn bind_blob(&self, idx: i32, value: &[u8]) -> Result<()> {
        self.safe_run(|api, _, stmt| unsafe { api.bind_blob(stmt, idx, value) })
    }

    /// Bind an owned value.
    pub fn bind_value(&self, idx: i32, value: &Value) -> Result<()> {
        match value {
            Value::Null => self.bind_null(idx),
            Value::Integer(v) => self.bind_int64(idx, *v),
            Value::Float(v) => self.bind_double(idx, *v),
            Value::Text(v) => self.bind_text(idx, v),
            Value::Blob(v) => self.bind_blob(idx, v),
        }
    }

    /// Columns in the result set.
    pub fn column_count(&self) -> Result<i32> {
        self.safe_run(|api, _, stmt| Ok(unsafe { api.column_count(stmt) }))
    }

    /// Storage class of `col` in the current row.
    pub fn column_type(&self, col: i32) -> Result<ValueType> {
        self.safe_run(|api, _, stmt| Ok(unsafe { api.column_type(stmt, col) }))
    }

    /// Output name of `col`.
    pub fn column_name(&self, col: i32) -> Result<Option<String>> {
        self.safe_run(|api, db, stmt| {
            let raw = unsafe { api.column_name(stmt, col) }.unwrap_or(RawBytes::null());
            unsafe { decode_text(raw, || api.errcode(db)) }
        })
    }

    /// Declared type of `col`, if it maps to a table column.
    pub fn column_decltype(&self, col: i32) -> Result<Option<String>> {
        self.safe_run(|api, db, stmt| {
            let raw = unsafe { api.column_decltype(stmt, col) }.unwrap_or(RawBytes::null());
            unsafe { decode_text(raw, || api.errcode(db)) }
        })
    }

    /// `col` as text; `None` for SQL NULL.
    pub fn column_text(&self, col: i32) -> Result<Option<String>> {
        self.safe_run(|api, db, stmt| {
            let raw = unsafe { api.column_text(stmt, col) };
            unsafe { decode_text(raw, || api.errcode(db)) }
        })
    }

    /// `col` as bytes; `None` for SQL NULL, empty for a zero-length blob.
    pub fn column_blob(&self, col: i32) -> Result<Option<Vec<u8>>> {
        self.safe_run(|api, db, stmt| {
            let ty = unsafe { api.column_type(stmt, col) };
            let raw = unsafe { api.column_blob(stmt, col) };
            unsafe { decode_blob(raw, ty, || api.errcode(db)) }
        })
    }

    /// `col` as a double.
    pub fn column_double(&self, col: i32) -> Result<f64> {
        self.safe_run(|api, _, stmt| Ok(unsafe { api.column_double(stmt, col) }))
    }

    /// `col` as a 32-bit integer.
    pub fn column_int(&self, col: i32) -> Result<i32> {
        self.safe_run(|api, _, stmt| Ok(unsafe { api.column_int(stmt, col) }))
    }

    /// `col` as a 64-bit integer.
    pub fn column_int64(&self, col: i32) -> Result<i64> {
        self.safe_run(|api, _, stmt| Ok(unsafe { api.column_int64(stmt, col) }))
    }

    /// `col` copied out with its own storage class.
    pub fn column_value(&self, col: i32) -> Result<Value> {
        self.safe_run(|api, db, stmt| {
            let value = match unsafe { api.column_type(stmt, col) } {
                ValueType::Null => Value::Null,
                ValueType::Integer => Value::Integer(unsafe { api.column_int64(stmt, col) }),
                ValueType::Float => Value::Float(unsafe { api.column_double(stmt, col) }),
                ValueType::Text => {
                    let raw = unsafe { api.column_text(stmt, col) };
                    unsafe { decode_text(raw, || api.errcode(db)) }?.map_or(Value::Null, Value::Text)
                }
                ty @ ValueType::Blob => {
                    let raw = unsafe { api.column_blob(stmt, col) };
                    unsafe { decode_blob(raw, ty, || api.errcode(db)) }?.map_or(Value::Null, Value::Blob)
                }
            };
            Ok(value)
        })
    }
}

impl<'c, 'p, P: Sqlite3Metadata> Statement<'c, 'p, P> {
    /// Table `col` originates from; `None` for expressions.
    pub fn column_table_name(&self, col: i32) -> Result<Option<String>> {
        if !self.conn.api.feature_set().contains(FeatureSet::COLUMN_METADATA) {
            return Err(Error::feature_unavailable("column_table_name not available"));
        }
        self.safe_run(|api, db, stmt| {
            let raw = unsafe { api.column_table_name(stmt, col) }.unwrap_or(RawBytes::null());
            unsafe { decode_text(raw, || api.errcode(db)) }
        })
    }
}

impl<P: Sqlite3Api> PartialEq for Statement<'_, '_, P> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<P: Sqlite3Api> Eq for Statement<'_, '_, P> {}

impl<P: Sqlite3Api> Hash for Statement<'_, '_, P> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.ptr.as_ptr() as usize).hash(state);
    }
}

impl<P: Sqlite3Api> core::fmt::Debug for Statement<'_, '_, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Statement")
            .field("id", &self.id)
            .field("ptr", &self.ptr)
            .finish()
    }
}

impl<P: Sqlite3Api> Drop for Statement<'_, '_, P> {
    fn drop(&mut self) {
        let mut state = self.conn.lock();
        if let Err(err) = state.statements.finalize(self.conn.api, self.id) {
            warn!(error = %err, "statement finalize failed on drop");
        }
        state.statements.forget(self.id);
    }
}
