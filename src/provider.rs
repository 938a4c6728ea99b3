use core::ffi::{c_char, c_void};
use core::ptr::NonNull;

use crate::error::{Error, Result};

/// Engine version triple.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    /// Major component (X in X.Y.Z).
    pub major: u16,
    /// Minor component (Y in X.Y.Z).
    pub minor: u16,
    /// Patch component (Z in X.Y.Z).
    pub patch: u16,
}

impl ApiVersion {
    /// Build a version from its components.
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Decode `sqlite3_libversion_number()` form (`X*1000000 + Y*1000 + Z`).
    pub const fn from_number(number: i32) -> Self {
        Self {
            major: (number / 1_000_000) as u16,
            minor: ((number / 1_000) % 1_000) as u16,
            patch: (number % 1_000) as u16,
        }
    }

    /// Encode back into `sqlite3_libversion_number()` form.
    pub const fn to_number(self) -> i32 {
        self.major as i32 * 1_000_000 + self.minor as i32 * 1_000 + self.patch as i32
    }
}

macro_rules! bit_set {
    ($(#[$meta:meta])* $name:ident($repr:ty) { $($(#[$cmeta:meta])* $flag:ident = $bit:expr;)* }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
        pub struct $name {
            bits: $repr,
        }

        impl $name {
            $($(#[$cmeta])* pub const $flag: $name = $name { bits: 1 << $bit };)*

            /// Empty set.
            pub const fn empty() -> Self {
                Self { bits: 0 }
            }

            /// Set built from raw bits.
            pub const fn from_bits(bits: $repr) -> Self {
                Self { bits }
            }

            /// Raw bit representation.
            pub const fn bits(self) -> $repr {
                self.bits
            }

            /// Whether every bit of `other` is present.
            pub const fn contains(self, other: $name) -> bool {
                (self.bits & other.bits) == other.bits
            }

            /// Whether no bit is set.
            pub const fn is_empty(self) -> bool {
                self.bits == 0
            }
        }

        impl core::ops::BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                $name { bits: self.bits | rhs.bits }
            }
        }

        impl core::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                self.bits |= rhs.bits;
            }
        }

        impl core::ops::BitAnd for $name {
            type Output = $name;

            fn bitand(self, rhs: $name) -> $name {
                $name { bits: self.bits & rhs.bits }
            }
        }

        impl core::ops::Not for $name {
            type Output = $name;

            fn not(self) -> $name {
                $name { bits: !self.bits }
            }
        }
    };
}

bit_set! {
    /// Optional engine capabilities detected when the backend was loaded.
    FeatureSet(u64) {
        /// `sqlite3_prepare_v3`.
        PREPARE_V3 = 0;
        /// `sqlite3_extended_errcode`.
        EXTENDED_ERRCODES = 1;
        /// `sqlite3_create_window_function`.
        WINDOW_FUNCTIONS = 2;
        /// 64-bit change counters.
        CHANGES64 = 3;
        /// Online backup API.
        BACKUP = 4;
        /// `sqlite3_serialize` / `sqlite3_deserialize`.
        SERIALIZE = 5;
        /// Column origin metadata.
        COLUMN_METADATA = 6;
        /// `sqlite3_enable_load_extension`.
        LOAD_EXTENSION = 7;
    }
}

bit_set! {
    /// Flags for opening a database handle.
    OpenFlags(u32) {
        /// Read-only.
        READ_ONLY = 0;
        /// Read-write.
        READ_WRITE = 1;
        /// Create the file when missing.
        CREATE = 2;
        /// Interpret the filename as a URI.
        URI = 3;
        /// Multi-thread mode for this handle.
        NO_MUTEX = 4;
        /// Serialized mode for this handle.
        FULL_MUTEX = 5;
        /// Shared page cache.
        SHARED_CACHE = 6;
        /// Private page cache.
        PRIVATE_CACHE = 7;
        /// In-memory database.
        MEMORY = 8;
    }
}

impl OpenFlags {
    /// `READ_WRITE | CREATE`, the usual flags for a writable connection.
    pub const fn read_write_create() -> Self {
        Self::from_bits(Self::READ_WRITE.bits() | Self::CREATE.bits())
    }

    /// Add `URI` when `path` uses the `file:` scheme (case-insensitive).
    pub fn with_uri_for(self, path: &str) -> Self {
        let is_uri = path
            .get(..5)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("file:"));
        if is_uri { self | Self::URI } else { self }
    }
}

bit_set! {
    /// Flags for user-defined function registration.
    FunctionFlags(u32) {
        /// Same inputs always give the same output.
        DETERMINISTIC = 0;
        /// Only callable from top-level SQL.
        DIRECT_ONLY = 1;
        /// Safe to use from views and triggers.
        INNOCUOUS = 2;
    }
}

bit_set! {
    /// Flags for `sqlite3_deserialize`.
    DeserializeFlags(u32) {
        /// Engine frees the buffer with `sqlite3_free` when done.
        FREE_ON_CLOSE = 0;
        /// Engine may grow the buffer with `sqlite3_realloc64`.
        RESIZEABLE = 1;
        /// Database is read-only.
        READ_ONLY = 2;
    }
}

/// Options passed to [`Sqlite3Api::open`].
#[derive(Clone, Copy, Debug)]
pub struct OpenOptions<'a> {
    /// Open flags.
    pub flags: OpenFlags,
    /// Optional VFS name.
    pub vfs: Option<&'a str>,
}

impl OpenOptions<'_> {
    /// Options with the default VFS.
    pub const fn new(flags: OpenFlags) -> Self {
        Self { flags, vfs: None }
    }
}

/// Outcome of a statement step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepResult {
    /// A row is available.
    Row,
    /// The statement has run to completion.
    Done,
}

/// Outcome of a successful backup step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupStep {
    /// Pages remain to be copied.
    More,
    /// Every page was copied.
    Done,
}

/// Storage class of a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// SQL NULL.
    Null,
    /// 64-bit signed integer.
    Integer,
    /// IEEE double.
    Float,
    /// UTF-8 text.
    Text,
    /// Bytes.
    Blob,
}

impl ValueType {
    /// Decode the engine's storage-class code.
    pub const fn from_code(code: i32) -> ValueType {
        match code {
            1 => ValueType::Integer,
            2 => ValueType::Float,
            3 => ValueType::Text,
            4 => ValueType::Blob,
            _ => ValueType::Null,
        }
    }

    /// Encode as the engine's storage-class code.
    pub const fn to_code(self) -> i32 {
        match self {
            ValueType::Integer => 1,
            ValueType::Float => 2,
            ValueType::Text => 3,
            ValueType::Blob => 4,
            ValueType::Null => 5,
        }
    }
}

/// Borrowed view of engine-owned bytes.
///
/// Valid only until the owning statement or value changes state (step,
/// reset, finalize, or the end of the current callback). A null `ptr` means
/// the engine returned no buffer; see [`crate::marshal`] for how that is told
/// apart from an allocation failure.
#[derive(Clone, Copy, Debug)]
pub struct RawBytes {
    /// Engine-owned pointer, possibly null.
    pub ptr: *const u8,
    /// Length reported by the engine.
    pub len: usize,
}

impl RawBytes {
    /// Null view.
    pub const fn null() -> Self {
        Self {
            ptr: core::ptr::null(),
            len: 0,
        }
    }

    /// Whether the engine returned no buffer.
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// # Safety
    /// The pointer must be valid for `len` bytes for the returned lifetime.
    pub unsafe fn as_slice<'a>(self) -> &'a [u8] {
        if self.ptr.is_null() {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// # Safety
    /// Same as [`RawBytes::as_slice`].
    pub unsafe fn as_str<'a>(self) -> Option<&'a str> {
        core::str::from_utf8(unsafe { self.as_slice() }).ok()
    }
}

/// Buffer allocated by the engine that the caller must release through
/// [`Sqlite3Serialize::free_image`].
#[derive(Clone, Copy, Debug)]
pub struct OwnedBytes {
    /// Start of the allocation.
    pub ptr: NonNull<u8>,
    /// Payload length.
    pub len: usize,
}

/// Declared constraints of a table column.
#[derive(Clone, Copy, Debug)]
pub struct ColumnMetadata {
    /// Declared type, if any.
    pub data_type: Option<RawBytes>,
    /// Collation sequence name, if any.
    pub coll_seq: Option<RawBytes>,
    /// `NOT NULL` constraint present.
    pub not_null: bool,
    /// Column is part of the primary key.
    pub primary_key: bool,
    /// Column is `AUTOINCREMENT`.
    pub autoinc: bool,
}

/// Native signature of a `user_data` destructor.
pub type DestroyCallback = extern "C" fn(*mut c_void);
/// Native signature of a collation compare function.
pub type CompareCallback = extern "C" fn(*mut c_void, i32, *const c_void, i32, *const c_void) -> i32;

/// Provider SPI over a SQLite C API backend.
///
/// # Safety
/// Implementations must uphold the SQLite C ABI contracts: handles passed in
/// are the ones the implementation handed out, and callback/user-data pairs
/// are passed through to the engine unchanged.
#[allow(clippy::missing_safety_doc, clippy::too_many_arguments)]
pub unsafe trait Sqlite3Api: Send + Sync + 'static {
    /// Opaque `sqlite3`.
    type Db;
    /// Opaque `sqlite3_stmt`.
    type Stmt;
    /// Opaque `sqlite3_value`.
    type Value;
    /// Opaque `sqlite3_context`.
    type Context;

    /// Version this provider was written against.
    fn api_version(&self) -> ApiVersion;
    /// Optional capabilities resolved at load time.
    fn feature_set(&self) -> FeatureSet;
    /// Backend identifier for diagnostics.
    fn backend_name(&self) -> &'static str;
    /// Runtime engine version, when queryable.
    fn backend_version(&self) -> Option<ApiVersion>;
    /// `sqlite3_libversion()` text.
    fn libversion(&self) -> &'static str;

    /// Engine-allocator memory, releasable through `free` and by the engine.
    unsafe fn malloc(&self, size: usize) -> *mut c_void;
    /// Release memory from `malloc`.
    unsafe fn free(&self, ptr: *mut c_void);

    /// `sqlite3_open_v2`. On failure the implementation reads the error code
    /// and message before releasing the half-open handle.
    unsafe fn open(&self, filename: &str, options: OpenOptions<'_>) -> Result<NonNull<Self::Db>>;
    /// `sqlite3_close`.
    unsafe fn close(&self, db: NonNull<Self::Db>) -> Result<()>;
    /// `sqlite3_extended_result_codes`.
    unsafe fn extended_result_codes(&self, db: NonNull<Self::Db>, on: bool) -> Result<()>;
    /// `sqlite3_interrupt`.
    unsafe fn interrupt(&self, db: NonNull<Self::Db>);
    /// `sqlite3_exec` without a row callback.
    unsafe fn exec(&self, db: NonNull<Self::Db>, sql: &str) -> Result<()>;

    /// `sqlite3_prepare_v2`.
    unsafe fn prepare_v2(&self, db: NonNull<Self::Db>, sql: &str) -> Result<NonNull<Self::Stmt>>;
    /// `sqlite3_prepare_v3`.
    unsafe fn prepare_v3(
        &self,
        db: NonNull<Self::Db>,
        sql: &str,
        flags: u32,
    ) -> Result<NonNull<Self::Stmt>>;
    /// `sqlite3_step`.
    unsafe fn step(&self, stmt: NonNull<Self::Stmt>) -> Result<StepResult>;
    /// `sqlite3_reset`.
    unsafe fn reset(&self, stmt: NonNull<Self::Stmt>) -> Result<()>;
    /// `sqlite3_finalize`.
    unsafe fn finalize(&self, stmt: NonNull<Self::Stmt>) -> Result<()>;
    /// `sqlite3_clear_bindings`.
    unsafe fn clear_bindings(&self, stmt: NonNull<Self::Stmt>) -> Result<()>;
    /// `sqlite3_bind_parameter_count`.
    unsafe fn bind_parameter_count(&self, stmt: NonNull<Self::Stmt>) -> i32;

    /// Bind NULL (1-based index).
    unsafe fn bind_null(&self, stmt: NonNull<Self::Stmt>, idx: i32) -> Result<()>;
    /// Bind a 32-bit integer.
    unsafe fn bind_int(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: i32) -> Result<()>;
    /// Bind a 64-bit integer.
    unsafe fn bind_int64(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: i64) -> Result<()>;
    /// Bind a double.
    unsafe fn bind_double(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: f64) -> Result<()>;
    /// Bind text. The engine must copy `v`.
    unsafe fn bind_text(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: &str) -> Result<()>;
    /// Bind bytes with an explicit length. The engine must copy `v`.
    unsafe fn bind_blob(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: &[u8]) -> Result<()>;

    /// Columns in the result set.
    unsafe fn column_count(&self, stmt: NonNull<Self::Stmt>) -> i32;
    /// Storage class of `col` in the current row.
    unsafe fn column_type(&self, stmt: NonNull<Self::Stmt>, col: i32) -> ValueType;
    /// Column as a 32-bit integer.
    unsafe fn column_int(&self, stmt: NonNull<Self::Stmt>, col: i32) -> i32;
    /// Column as a 64-bit integer.
    unsafe fn column_int64(&self, stmt: NonNull<Self::Stmt>, col: i32) -> i64;
    /// Column as a double.
    unsafe fn column_double(&self, stmt: NonNull<Self::Stmt>, col: i32) -> f64;
    /// Column text with its engine-reported byte length. Null when absent.
    unsafe fn column_text(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes;
    /// Column bytes with their engine-reported length. Null when absent.
    unsafe fn column_blob(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes;
    /// Output column name.
    unsafe fn column_name(&self, stmt: NonNull<Self::Stmt>, col: i32) -> Option<RawBytes>;
    /// Declared column type.
    unsafe fn column_decltype(&self, stmt: NonNull<Self::Stmt>, col: i32) -> Option<RawBytes>;

    /// `sqlite3_errcode`.
    unsafe fn errcode(&self, db: NonNull<Self::Db>) -> i32;
    /// `sqlite3_errmsg`.
    unsafe fn errmsg(&self, db: NonNull<Self::Db>) -> *const c_char;
    /// `sqlite3_extended_errcode`, when available.
    unsafe fn extended_errcode(&self, db: NonNull<Self::Db>) -> Option<i32>;

    /// Rows changed by the last statement. Falls back to the 32-bit counter.
    unsafe fn changes(&self, db: NonNull<Self::Db>) -> i64;
    /// Rows changed since the handle was opened. Falls back to the 32-bit counter.
    unsafe fn total_changes(&self, db: NonNull<Self::Db>) -> i64;
    /// `sqlite3_limit`: set `id` to `value` (negative queries) and return the old value.
    unsafe fn limit(&self, db: NonNull<Self::Db>, id: i32, value: i32) -> i32;

    /// Register scalar (`x_func`) or aggregate (`x_step` + `x_final`) callbacks.
    ///
    /// # Ownership contract
    /// Ownership of `user_data` moves to the provider at call entry. On
    /// success `drop_user_data` runs once when the definition is replaced,
    /// removed, or the connection closes. On failure the provider runs
    /// `drop_user_data` before returning.
    unsafe fn create_function_v2(
        &self,
        db: NonNull<Self::Db>,
        name: &str,
        n_args: i32,
        flags: FunctionFlags,
        x_func: Option<extern "C" fn(*mut Self::Context, i32, *mut *mut Self::Value)>,
        x_step: Option<extern "C" fn(*mut Self::Context, i32, *mut *mut Self::Value)>,
        x_final: Option<extern "C" fn(*mut Self::Context)>,
        user_data: *mut c_void,
        drop_user_data: Option<DestroyCallback>,
    ) -> Result<()>;

    /// Register aggregate/window callbacks. Same ownership contract as
    /// [`Sqlite3Api::create_function_v2`].
    unsafe fn create_window_function(
        &self,
        db: NonNull<Self::Db>,
        name: &str,
        n_args: i32,
        flags: FunctionFlags,
        x_step: Option<extern "C" fn(*mut Self::Context, i32, *mut *mut Self::Value)>,
        x_final: Option<extern "C" fn(*mut Self::Context)>,
        x_value: Option<extern "C" fn(*mut Self::Context)>,
        x_inverse: Option<extern "C" fn(*mut Self::Context, i32, *mut *mut Self::Value)>,
        user_data: *mut c_void,
        drop_user_data: Option<DestroyCallback>,
    ) -> Result<()>;

    /// Register or remove (`cmp == None`) a UTF-8 collation. Same ownership
    /// contract as [`Sqlite3Api::create_function_v2`].
    unsafe fn create_collation_v2(
        &self,
        db: NonNull<Self::Db>,
        name: &str,
        context: *mut c_void,
        cmp: Option<CompareCallback>,
        destroy: Option<DestroyCallback>,
    ) -> Result<()>;

    /// Per-group aggregate memory; `bytes == 0` only looks it up.
    unsafe fn aggregate_context(&self, ctx: NonNull<Self::Context>, bytes: usize) -> *mut c_void;
    /// Function result: NULL.
    unsafe fn result_null(&self, ctx: NonNull<Self::Context>);
    /// Function result: integer.
    unsafe fn result_int64(&self, ctx: NonNull<Self::Context>, v: i64);
    /// Function result: double.
    unsafe fn result_double(&self, ctx: NonNull<Self::Context>, v: f64);
    /// Function result: text (copied).
    unsafe fn result_text(&self, ctx: NonNull<Self::Context>, v: &str);
    /// Function result: bytes (copied).
    unsafe fn result_blob(&self, ctx: NonNull<Self::Context>, v: &[u8]);
    /// Function result: error with message.
    unsafe fn result_error(&self, ctx: NonNull<Self::Context>, msg: &str);
    /// `user_data` of the function being invoked.
    unsafe fn user_data(ctx: NonNull<Self::Context>) -> *mut c_void;

    /// Storage class of an argument.
    unsafe fn value_type(&self, v: NonNull<Self::Value>) -> ValueType;
    /// Argument as a 32-bit integer.
    unsafe fn value_int(&self, v: NonNull<Self::Value>) -> i32;
    /// Argument as a 64-bit integer.
    unsafe fn value_int64(&self, v: NonNull<Self::Value>) -> i64;
    /// Argument as a double.
    unsafe fn value_double(&self, v: NonNull<Self::Value>) -> f64;
    /// Argument text with its byte length. Null when absent.
    unsafe fn value_text(&self, v: NonNull<Self::Value>) -> RawBytes;
    /// Argument bytes with their length. Null when absent.
    unsafe fn value_blob(&self, v: NonNull<Self::Value>) -> RawBytes;

    /// `sqlite3_enable_load_extension`.
    unsafe fn enable_load_extension(&self, _db: NonNull<Self::Db>, _on: bool) -> Result<()> {
        Err(Error::feature_unavailable(
            "enable_load_extension unsupported",
        ))
    }

    /// `sqlite3_enable_shared_cache` (process-wide).
    fn enable_shared_cache(&self, _on: bool) -> Result<()> {
        Err(Error::feature_unavailable("enable_shared_cache unsupported"))
    }
}

/// Native busy handler: `(context, previous_invocations) -> retry`.
pub type BusyCallback = extern "C" fn(*mut c_void, i32) -> i32;
/// Native progress handler: `(context) -> abort`.
pub type ProgressCallback = extern "C" fn(*mut c_void) -> i32;
/// Native commit hook: `(context) -> veto`.
pub type CommitCallback = extern "C" fn(*mut c_void) -> i32;
/// Native rollback hook.
pub type RollbackCallback = extern "C" fn(*mut c_void);
/// Native update hook: `(context, op, db_name, table, rowid)`.
pub type UpdateCallback = extern "C" fn(*mut c_void, i32, *const c_char, *const c_char, i64);

/// Optional backend extension for connection hooks.
///
/// Every setter replaces the previous registration of the same kind; passing
/// `None` clears it. The engine does not take ownership of `context`.
///
/// # Safety
/// Implementations must pass callbacks and contexts to the engine unchanged.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait Sqlite3Hooks: Sqlite3Api {
    /// `sqlite3_busy_timeout`.
    unsafe fn busy_timeout(&self, db: NonNull<Self::Db>, ms: i32) -> Result<()>;
    /// `sqlite3_busy_handler`.
    unsafe fn busy_handler(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<BusyCallback>,
        context: *mut c_void,
    ) -> Result<()>;
    /// `sqlite3_progress_handler`.
    unsafe fn progress_handler(
        &self,
        db: NonNull<Self::Db>,
        n_ops: i32,
        callback: Option<ProgressCallback>,
        context: *mut c_void,
    ) -> Result<()>;
    /// `sqlite3_commit_hook`.
    unsafe fn commit_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<CommitCallback>,
        context: *mut c_void,
    ) -> Result<()>;
    /// `sqlite3_rollback_hook`.
    unsafe fn rollback_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<RollbackCallback>,
        context: *mut c_void,
    ) -> Result<()>;
    /// `sqlite3_update_hook`.
    unsafe fn update_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<UpdateCallback>,
        context: *mut c_void,
    ) -> Result<()>;
}

/// Optional backend extension for the online backup API.
///
/// # Safety
/// Backup handles must stay tied to the database handles they were created
/// from and be released exactly once through `backup_finish`.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait Sqlite3Backup: Sqlite3Api {
    /// Opaque `sqlite3_backup`.
    type Backup;
    /// `sqlite3_backup_init`. On failure the error is read from `dest_db`.
    unsafe fn backup_init(
        &self,
        dest_db: NonNull<Self::Db>,
        dest_name: &str,
        source_db: NonNull<Self::Db>,
        source_name: &str,
    ) -> Result<NonNull<Self::Backup>>;
    /// `sqlite3_backup_step`. Busy and locked conditions come back as errors
    /// with [`crate::ErrorCode::Busy`] / [`crate::ErrorCode::Locked`].
    unsafe fn backup_step(&self, backup: NonNull<Self::Backup>, pages: i32) -> Result<BackupStep>;
    /// Pages still to copy.
    unsafe fn backup_remaining(&self, backup: NonNull<Self::Backup>) -> i32;
    /// Pages in the source database.
    unsafe fn backup_pagecount(&self, backup: NonNull<Self::Backup>) -> i32;
    /// `sqlite3_backup_finish`.
    unsafe fn backup_finish(&self, backup: NonNull<Self::Backup>) -> Result<()>;
}

/// Optional backend extension for whole-database serialization.
///
/// # Safety
/// Borrowed images must not be freed. Owned images must be released through
/// `free_image`. `deserialize` takes ownership of `data` when
/// [`DeserializeFlags::FREE_ON_CLOSE`] is set, including on failure.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait Sqlite3Serialize: Sqlite3Api {
    /// `sqlite3_serialize` with `SQLITE_SERIALIZE_NOCOPY`. `None` when the
    /// engine cannot expose its image without copying.
    unsafe fn serialize_borrowed(
        &self,
        db: NonNull<Self::Db>,
        schema: &str,
    ) -> Result<Option<RawBytes>>;
    /// Copying `sqlite3_serialize`. `None` on allocation failure.
    unsafe fn serialize(&self, db: NonNull<Self::Db>, schema: &str) -> Result<Option<OwnedBytes>>;
    /// `sqlite3_deserialize` over an engine-allocated buffer of `len` bytes.
    unsafe fn deserialize(
        &self,
        db: NonNull<Self::Db>,
        schema: &str,
        data: NonNull<u8>,
        len: usize,
        flags: DeserializeFlags,
    ) -> Result<()>;
    /// `SQLITE_FCNTL_SIZE_LIMIT`; returns the limit now in force.
    unsafe fn set_size_limit(&self, db: NonNull<Self::Db>, schema: &str, limit: i64)
    -> Result<i64>;
    /// Release an owned image.
    unsafe fn free_image(&self, bytes: OwnedBytes);
}

/// Optional backend extension for column origin metadata.
///
/// # Safety
/// Returned views follow the engine's metadata lifetime rules.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait Sqlite3Metadata: Sqlite3Api {
    /// `sqlite3_table_column_metadata`.
    unsafe fn table_column_metadata(
        &self,
        db: NonNull<Self::Db>,
        db_name: Option<&str>,
        table: &str,
        column: &str,
    ) -> Result<ColumnMetadata>;
    /// Table the result column originates from.
    unsafe fn column_table_name(&self, stmt: NonNull<Self::Stmt>, col: i32) -> Option<RawBytes>;
    /// Table column the result column originates from.
    unsafe fn column_origin_name(&self, stmt: NonNull<Self::Stmt>, col: i32) -> Option<RawBytes>;
}
