//! Dynamic `libsqlite3` backend for `sqlite-interop`.
//!
//! The library is opened with `dlopen` on first use and every entry point is
//! resolved with `dlsym` into a table of function pointers. Entry points that
//! older engine builds lack are kept as `Option` and reported through
//! [`FeatureSet`]; calling through a missing one yields
//! [`ErrorCode::FeatureUnavailable`].

#![allow(non_camel_case_types)]

use libc::{c_char, c_int, c_uchar, c_void};
use sqlite_interop::{
    ApiVersion, BusyCallback, CommitCallback, CompareCallback, DestroyCallback, Error, ErrorCode,
    FeatureSet, FunctionFlags, OpenFlags, ProgressCallback, RawBytes, Result, RollbackCallback,
    UpdateCallback,
};
use std::ffi::{CStr, CString};
use std::ptr::{NonNull, null, null_mut};
use std::sync::OnceLock;
use tracing::debug;

use sqlite_interop::marshal::cstring as c_arg;

mod core_impl;
mod extensions_impl;

pub use extensions_impl::BackupHandle;

#[cfg(target_os = "linux")]
#[link(name = "dl")]
unsafe extern "C" {}

/// Environment variable naming an explicit library path, tried first.
pub const LIBRARY_ENV: &str = "SQLITE_INTEROP_LIBRARY";

const SQLITE_OK: c_int = 0;
const SQLITE_NOMEM: c_int = 7;
const SQLITE_ROW: c_int = 100;
const SQLITE_DONE: c_int = 101;

const SQLITE_OPEN_READONLY: c_int = 0x0000_0001;
const SQLITE_OPEN_READWRITE: c_int = 0x0000_0002;
const SQLITE_OPEN_CREATE: c_int = 0x0000_0004;
const SQLITE_OPEN_URI: c_int = 0x0000_0040;
const SQLITE_OPEN_MEMORY: c_int = 0x0000_0080;
const SQLITE_OPEN_NOMUTEX: c_int = 0x0000_8000;
const SQLITE_OPEN_FULLMUTEX: c_int = 0x0001_0000;
const SQLITE_OPEN_SHAREDCACHE: c_int = 0x0002_0000;
const SQLITE_OPEN_PRIVATECACHE: c_int = 0x0004_0000;

const SQLITE_UTF8: c_int = 0x0000_0001;
const SQLITE_DETERMINISTIC: c_int = 0x0000_0800;
const SQLITE_DIRECTONLY: c_int = 0x0008_0000;
const SQLITE_INNOCUOUS: c_int = 0x0020_0000;

const SQLITE_SERIALIZE_NOCOPY: u32 = 0x001;
const SQLITE_DESERIALIZE_FREEONCLOSE: u32 = 1;
const SQLITE_DESERIALIZE_RESIZEABLE: u32 = 2;
const SQLITE_DESERIALIZE_READONLY: u32 = 4;
const SQLITE_FCNTL_SIZE_LIMIT: c_int = 36;

const EMPTY_BYTE: u8 = 0;

type sqlite3 = c_void;
type sqlite3_stmt = c_void;
type sqlite3_value = c_void;
type sqlite3_context = c_void;
type sqlite3_backup = c_void;

type sqlite3_destructor_type = Option<unsafe extern "C" fn(*mut c_void)>;
type XFunc = Option<extern "C" fn(*mut sqlite3_context, c_int, *mut *mut sqlite3_value)>;
type XFinal = Option<extern "C" fn(*mut sqlite3_context)>;
type ExecCallback =
    Option<extern "C" fn(*mut c_void, c_int, *mut *mut c_char, *mut *mut c_char) -> c_int>;

type OpenV2 =
    unsafe extern "C" fn(*const c_char, *mut *mut sqlite3, c_int, *const c_char) -> c_int;
type Close = unsafe extern "C" fn(*mut sqlite3) -> c_int;
type ExtendedResultCodes = unsafe extern "C" fn(*mut sqlite3, c_int) -> c_int;
type Exec = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    ExecCallback,
    *mut c_void,
    *mut *mut c_char,
) -> c_int;
type Interrupt = unsafe extern "C" fn(*mut sqlite3);
type PrepareV2 = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    c_int,
    *mut *mut sqlite3_stmt,
    *mut *const c_char,
) -> c_int;
type PrepareV3 = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    c_int,
    u32,
    *mut *mut sqlite3_stmt,
    *mut *const c_char,
) -> c_int;
type StmtFn = unsafe extern "C" fn(*mut sqlite3_stmt) -> c_int;
type DbHandle = unsafe extern "C" fn(*mut sqlite3_stmt) -> *mut sqlite3;

type BindNull = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> c_int;
type BindInt = unsafe extern "C" fn(*mut sqlite3_stmt, c_int, c_int) -> c_int;
type BindInt64 = unsafe extern "C" fn(*mut sqlite3_stmt, c_int, i64) -> c_int;
type BindDouble = unsafe extern "C" fn(*mut sqlite3_stmt, c_int, f64) -> c_int;
type BindText = unsafe extern "C" fn(
    *mut sqlite3_stmt,
    c_int,
    *const c_char,
    c_int,
    sqlite3_destructor_type,
) -> c_int;
type BindBlob = unsafe extern "C" fn(
    *mut sqlite3_stmt,
    c_int,
    *const c_void,
    c_int,
    sqlite3_destructor_type,
) -> c_int;

type ColumnInt = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> c_int;
type ColumnInt64 = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> i64;
type ColumnDouble = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> f64;
type ColumnText = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> *const c_uchar;
type ColumnBlob = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> *const c_void;
type ColumnStr = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> *const c_char;

type ErrCode = unsafe extern "C" fn(*mut sqlite3) -> c_int;
type ErrMsg = unsafe extern "C" fn(*mut sqlite3) -> *const c_char;
type ErrStr = unsafe extern "C" fn(c_int) -> *const c_char;
type Changes = unsafe extern "C" fn(*mut sqlite3) -> c_int;
type Changes64 = unsafe extern "C" fn(*mut sqlite3) -> i64;
type Limit = unsafe extern "C" fn(*mut sqlite3, c_int, c_int) -> c_int;

type BusyTimeout = unsafe extern "C" fn(*mut sqlite3, c_int) -> c_int;
type BusyHandler = unsafe extern "C" fn(*mut sqlite3, Option<BusyCallback>, *mut c_void) -> c_int;
type ProgressHandler =
    unsafe extern "C" fn(*mut sqlite3, c_int, Option<ProgressCallback>, *mut c_void);
type CommitHook =
    unsafe extern "C" fn(*mut sqlite3, Option<CommitCallback>, *mut c_void) -> *mut c_void;
type RollbackHook =
    unsafe extern "C" fn(*mut sqlite3, Option<RollbackCallback>, *mut c_void) -> *mut c_void;
type UpdateHook =
    unsafe extern "C" fn(*mut sqlite3, Option<UpdateCallback>, *mut c_void) -> *mut c_void;

type CreateFunctionV2 = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    c_int,
    c_int,
    *mut c_void,
    XFunc,
    XFunc,
    XFinal,
    Option<DestroyCallback>,
) -> c_int;
type CreateWindowFunction = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    c_int,
    c_int,
    *mut c_void,
    XFunc,
    XFinal,
    XFinal,
    XFunc,
    Option<DestroyCallback>,
) -> c_int;
type CreateCollationV2 = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    c_int,
    *mut c_void,
    Option<CompareCallback>,
    Option<DestroyCallback>,
) -> c_int;

type AggregateContext = unsafe extern "C" fn(*mut sqlite3_context, c_int) -> *mut c_void;
type ResultNull = unsafe extern "C" fn(*mut sqlite3_context);
type ResultInt64 = unsafe extern "C" fn(*mut sqlite3_context, i64);
type ResultDouble = unsafe extern "C" fn(*mut sqlite3_context, f64);
type ResultText =
    unsafe extern "C" fn(*mut sqlite3_context, *const c_char, c_int, sqlite3_destructor_type);
type ResultBlob =
    unsafe extern "C" fn(*mut sqlite3_context, *const c_void, c_int, sqlite3_destructor_type);
type ResultError = unsafe extern "C" fn(*mut sqlite3_context, *const c_char, c_int);
type UserData = unsafe extern "C" fn(*mut sqlite3_context) -> *mut c_void;

type ValueTypeFn = unsafe extern "C" fn(*mut sqlite3_value) -> c_int;
type ValueInt64Fn = unsafe extern "C" fn(*mut sqlite3_value) -> i64;
type ValueDoubleFn = unsafe extern "C" fn(*mut sqlite3_value) -> f64;
type ValueTextFn = unsafe extern "C" fn(*mut sqlite3_value) -> *const c_uchar;
type ValueBlobFn = unsafe extern "C" fn(*mut sqlite3_value) -> *const c_void;
type ValueBytesFn = unsafe extern "C" fn(*mut sqlite3_value) -> c_int;

type Libversion = unsafe extern "C" fn() -> *const c_char;
type LibversionNumber = unsafe extern "C" fn() -> c_int;
type Malloc = unsafe extern "C" fn(c_int) -> *mut c_void;
type Malloc64 = unsafe extern "C" fn(u64) -> *mut c_void;
type Free = unsafe extern "C" fn(*mut c_void);

type TableColumnMetadata = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    *const c_char,
    *const c_char,
    *mut *const c_char,
    *mut *const c_char,
    *mut c_int,
    *mut c_int,
    *mut c_int,
) -> c_int;

type BackupInit = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    *mut sqlite3,
    *const c_char,
) -> *mut sqlite3_backup;
type BackupStepFn = unsafe extern "C" fn(*mut sqlite3_backup, c_int) -> c_int;
type BackupCount = unsafe extern "C" fn(*mut sqlite3_backup) -> c_int;
type BackupFinish = unsafe extern "C" fn(*mut sqlite3_backup) -> c_int;

type Serialize = unsafe extern "C" fn(*mut sqlite3, *const c_char, *mut i64, u32) -> *mut c_uchar;
type Deserialize =
    unsafe extern "C" fn(*mut sqlite3, *const c_char, *mut c_uchar, i64, i64, u32) -> c_int;
type FileControl = unsafe extern "C" fn(*mut sqlite3, *const c_char, c_int, *mut c_void) -> c_int;

type EnableLoadExtension = unsafe extern "C" fn(*mut sqlite3, c_int) -> c_int;
type EnableSharedCache = unsafe extern "C" fn(c_int) -> c_int;

/// Why the native library could not be bound.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    /// No candidate could be opened with `dlopen`.
    #[error("could not load libsqlite3, tried: {}", .tried.join(", "))]
    LibraryNotFound {
        /// Candidates in the order they were tried.
        tried: Vec<String>,
    },
    /// The library lacks an entry point every supported engine provides.
    #[error("libsqlite3 is missing required symbol `{0}`")]
    MissingSymbol(&'static str),
}

struct LibHandle {
    handle: *mut c_void,
}

unsafe impl Send for LibHandle {}
unsafe impl Sync for LibHandle {}

impl LibHandle {
    /// Open the first candidate `dlopen` accepts; also returns its name.
    fn open(candidates: &[String]) -> std::result::Result<(Self, String), LoadError> {
        for name in candidates {
            let Ok(cname) = CString::new(name.as_str()) else {
                continue;
            };
            let handle =
                unsafe { libc::dlopen(cname.as_ptr(), libc::RTLD_LAZY | libc::RTLD_LOCAL) };
            if !handle.is_null() {
                return Ok((Self { handle }, name.clone()));
            }
        }
        Err(LoadError::LibraryNotFound {
            tried: candidates.to_vec(),
        })
    }

    /// # Safety
    /// `T` must be a function pointer type matching the symbol's C signature.
    unsafe fn symbol<T: Copy>(&self, name: &'static CStr) -> Option<T> {
        let sym = unsafe { libc::dlsym(self.handle, name.as_ptr()) };
        if sym.is_null() {
            None
        } else {
            debug_assert_eq!(size_of::<T>(), size_of::<*mut c_void>());
            Some(unsafe { std::mem::transmute_copy(&sym) })
        }
    }

    /// # Safety
    /// Same as [`LibHandle::symbol`].
    unsafe fn required<T: Copy>(&self, name: &'static CStr) -> std::result::Result<T, LoadError> {
        unsafe { self.symbol(name) }.ok_or_else(|| LoadError::MissingSymbol(symbol_name(name)))
    }
}

fn symbol_name(name: &'static CStr) -> &'static str {
    name.to_str().unwrap_or("<non-utf8 symbol>")
}

struct LibSqlite3Fns {
    open_v2: OpenV2,
    close: Close,
    extended_result_codes: ExtendedResultCodes,
    exec: Exec,
    interrupt: Interrupt,
    prepare_v2: PrepareV2,
    prepare_v3: Option<PrepareV3>,
    step: StmtFn,
    reset: StmtFn,
    finalize: StmtFn,
    clear_bindings: StmtFn,
    bind_parameter_count: StmtFn,
    db_handle: DbHandle,
    bind_null: BindNull,
    bind_int: BindInt,
    bind_int64: BindInt64,
    bind_double: BindDouble,
    bind_text: BindText,
    bind_blob: BindBlob,
    column_count: StmtFn,
    column_type: ColumnInt,
    column_int: ColumnInt,
    column_int64: ColumnInt64,
    column_double: ColumnDouble,
    column_text: ColumnText,
    column_blob: ColumnBlob,
    column_bytes: ColumnInt,
    column_name: ColumnStr,
    column_decltype: ColumnStr,
    column_table_name: Option<ColumnStr>,
    column_origin_name: Option<ColumnStr>,
    errcode: ErrCode,
    errmsg: ErrMsg,
    extended_errcode: Option<ErrCode>,
    errstr: Option<ErrStr>,
    changes: Changes,
    total_changes: Changes,
    changes64: Option<Changes64>,
    total_changes64: Option<Changes64>,
    limit: Limit,
    busy_timeout: BusyTimeout,
    busy_handler: BusyHandler,
    progress_handler: ProgressHandler,
    commit_hook: CommitHook,
    rollback_hook: RollbackHook,
    update_hook: UpdateHook,
    create_function_v2: CreateFunctionV2,
    create_window_function: Option<CreateWindowFunction>,
    create_collation_v2: CreateCollationV2,
    aggregate_context: AggregateContext,
    result_null: ResultNull,
    result_int64: ResultInt64,
    result_double: ResultDouble,
    result_text: ResultText,
    result_blob: ResultBlob,
    result_error: ResultError,
    user_data: UserData,
    value_type: ValueTypeFn,
    value_int64: ValueInt64Fn,
    value_double: ValueDoubleFn,
    value_text: ValueTextFn,
    value_blob: ValueBlobFn,
    value_bytes: ValueBytesFn,
    libversion: Libversion,
    libversion_number: LibversionNumber,
    malloc: Malloc,
    malloc64: Option<Malloc64>,
    free: Free,
    table_column_metadata: Option<TableColumnMetadata>,
    backup_init: Option<BackupInit>,
    backup_step: Option<BackupStepFn>,
    backup_remaining: Option<BackupCount>,
    backup_pagecount: Option<BackupCount>,
    backup_finish: Option<BackupFinish>,
    serialize: Option<Serialize>,
    deserialize: Option<Deserialize>,
    file_control: Option<FileControl>,
    enable_load_extension: Option<EnableLoadExtension>,
    enable_shared_cache: Option<EnableSharedCache>,
}

impl LibSqlite3Fns {
    unsafe fn load(lib: &LibHandle) -> std::result::Result<Self, LoadError> {
        unsafe {
            Ok(Self {
                open_v2: lib.required(c"sqlite3_open_v2")?,
                close: lib.required(c"sqlite3_close")?,
                extended_result_codes: lib.required(c"sqlite3_extended_result_codes")?,
                exec: lib.required(c"sqlite3_exec")?,
                interrupt: lib.required(c"sqlite3_interrupt")?,
                prepare_v2: lib.required(c"sqlite3_prepare_v2")?,
                prepare_v3: lib.symbol(c"sqlite3_prepare_v3"),
                step: lib.required(c"sqlite3_step")?,
                reset: lib.required(c"sqlite3_reset")?,
                finalize: lib.required(c"sqlite3_finalize")?,
                clear_bindings: lib.required(c"sqlite3_clear_bindings")?,
                bind_parameter_count: lib.required(c"sqlite3_bind_parameter_count")?,
                db_handle: lib.required(c"sqlite3_db_handle")?,
                bind_null: lib.required(c"sqlite3_bind_null")?,
                bind_int: lib.required(c"sqlite3_bind_int")?,
                bind_int64: lib.required(c"sqlite3_bind_int64")?,
                bind_double: lib.required(c"sqlite3_bind_double")?,
                bind_text: lib.required(c"sqlite3_bind_text")?,
                bind_blob: lib.required(c"sqlite3_bind_blob")?,
                column_count: lib.required(c"sqlite3_column_count")?,
                column_type: lib.required(c"sqlite3_column_type")?,
                column_int: lib.required(c"sqlite3_column_int")?,
                column_int64: lib.required(c"sqlite3_column_int64")?,
                column_double: lib.required(c"sqlite3_column_double")?,
                column_text: lib.required(c"sqlite3_column_text")?,
                column_blob: lib.required(c"sqlite3_column_blob")?,
                column_bytes: lib.required(c"sqlite3_column_bytes")?,
                column_name: lib.required(c"sqlite3_column_name")?,
                column_decltype: lib.required(c"sqlite3_column_decltype")?,
                column_table_name: lib.symbol(c"sqlite3_column_table_name"),
                column_origin_name: lib.symbol(c"sqlite3_column_origin_name"),
                errcode: lib.required(c"sqlite3_errcode")?,
                errmsg: lib.required(c"sqlite3_errmsg")?,
                extended_errcode: lib.symbol(c"sqlite3_extended_errcode"),
                errstr: lib.symbol(c"sqlite3_errstr"),
                changes: lib.required(c"sqlite3_changes")?,
                total_changes: lib.required(c"sqlite3_total_changes")?,
                changes64: lib.symbol(c"sqlite3_changes64"),
                total_changes64: lib.symbol(c"sqlite3_total_changes64"),
                limit: lib.required(c"sqlite3_limit")?,
                busy_timeout: lib.required(c"sqlite3_busy_timeout")?,
                busy_handler: lib.required(c"sqlite3_busy_handler")?,
                progress_handler: lib.required(c"sqlite3_progress_handler")?,
                commit_hook: lib.required(c"sqlite3_commit_hook")?,
                rollback_hook: lib.required(c"sqlite3_rollback_hook")?,
                update_hook: lib.required(c"sqlite3_update_hook")?,
                create_function_v2: lib.required(c"sqlite3_create_function_v2")?,
                create_window_function: lib.symbol(c"sqlite3_create_window_function"),
                create_collation_v2: lib.required(c"sqlite3_create_collation_v2")?,
                aggregate_context: lib.required(c"sqlite3_aggregate_context")?,
                result_null: lib.required(c"sqlite3_result_null")?,
                result_int64: lib.required(c"sqlite3_result_int64")?,
                result_double: lib.required(c"sqlite3_result_double")?,
                result_text: lib.required(c"sqlite3_result_text")?,
                result_blob: lib.required(c"sqlite3_result_blob")?,
                result_error: lib.required(c"sqlite3_result_error")?,
                user_data: lib.required(c"sqlite3_user_data")?,
                value_type: lib.required(c"sqlite3_value_type")?,
                value_int64: lib.required(c"sqlite3_value_int64")?,
                value_double: lib.required(c"sqlite3_value_double")?,
                value_text: lib.required(c"sqlite3_value_text")?,
                value_blob: lib.required(c"sqlite3_value_blob")?,
                value_bytes: lib.required(c"sqlite3_value_bytes")?,
                libversion: lib.required(c"sqlite3_libversion")?,
                libversion_number: lib.required(c"sqlite3_libversion_number")?,
                malloc: lib.required(c"sqlite3_malloc")?,
                malloc64: lib.symbol(c"sqlite3_malloc64"),
                free: lib.required(c"sqlite3_free")?,
                table_column_metadata: lib.symbol(c"sqlite3_table_column_metadata"),
                backup_init: lib.symbol(c"sqlite3_backup_init"),
                backup_step: lib.symbol(c"sqlite3_backup_step"),
                backup_remaining: lib.symbol(c"sqlite3_backup_remaining"),
                backup_pagecount: lib.symbol(c"sqlite3_backup_pagecount"),
                backup_finish: lib.symbol(c"sqlite3_backup_finish"),
                serialize: lib.symbol(c"sqlite3_serialize"),
                deserialize: lib.symbol(c"sqlite3_deserialize"),
                file_control: lib.symbol(c"sqlite3_file_control"),
                enable_load_extension: lib.symbol(c"sqlite3_enable_load_extension"),
                enable_shared_cache: lib.symbol(c"sqlite3_enable_shared_cache"),
            })
        }
    }

    fn features(&self) -> FeatureSet {
        let mut features = FeatureSet::empty();
        if self.prepare_v3.is_some() {
            features |= FeatureSet::PREPARE_V3;
        }
        if self.extended_errcode.is_some() {
            features |= FeatureSet::EXTENDED_ERRCODES;
        }
        if self.create_window_function.is_some() {
            features |= FeatureSet::WINDOW_FUNCTIONS;
        }
        if self.changes64.is_some() && self.total_changes64.is_some() {
            features |= FeatureSet::CHANGES64;
        }
        if self.backup_init.is_some()
            && self.backup_step.is_some()
            && self.backup_remaining.is_some()
            && self.backup_pagecount.is_some()
            && self.backup_finish.is_some()
        {
            features |= FeatureSet::BACKUP;
        }
        if self.serialize.is_some() && self.deserialize.is_some() && self.file_control.is_some() {
            features |= FeatureSet::SERIALIZE;
        }
        if self.column_table_name.is_some()
            && self.column_origin_name.is_some()
            && self.table_column_metadata.is_some()
        {
            features |= FeatureSet::COLUMN_METADATA;
        }
        if self.enable_load_extension.is_some() {
            features |= FeatureSet::LOAD_EXTENSION;
        }
        features
    }
}

static LIBRARY: OnceLock<std::result::Result<&'static LibSqlite3, LoadError>> = OnceLock::new();

/// `libsqlite3` bound at run time through `dlopen`.
pub struct LibSqlite3 {
    fns: LibSqlite3Fns,
    features: FeatureSet,
    api_version: ApiVersion,
    libversion: &'static str,
    _lib: LibHandle,
}

impl LibSqlite3 {
    /// Load `libsqlite3` and return the process-wide adapter.
    ///
    /// The first call decides the outcome; later calls, including concurrent
    /// ones, observe the same adapter or the same error.
    pub fn load() -> std::result::Result<&'static LibSqlite3, LoadError> {
        LIBRARY.get_or_init(Self::bind).clone()
    }

    /// Library names tried by [`LibSqlite3::load`], in order.
    pub fn candidates() -> Vec<String> {
        #[cfg(target_os = "macos")]
        const DEFAULT_NAMES: [&str; 3] = ["libsqlite3.dylib", "libsqlite3.so.0", "libsqlite3.so"];
        #[cfg(not(target_os = "macos"))]
        const DEFAULT_NAMES: [&str; 2] = ["libsqlite3.so.0", "libsqlite3.so"];

        let mut names = Vec::with_capacity(DEFAULT_NAMES.len() + 1);
        if let Some(path) = std::env::var(LIBRARY_ENV).ok().filter(|p| !p.is_empty()) {
            names.push(path);
        }
        names.extend(DEFAULT_NAMES.iter().map(|name| (*name).to_owned()));
        names
    }

    fn bind() -> std::result::Result<&'static LibSqlite3, LoadError> {
        let (lib, name) = LibHandle::open(&Self::candidates())?;
        let fns = unsafe { LibSqlite3Fns::load(&lib)? };
        let api_version = ApiVersion::from_number(unsafe { (fns.libversion_number)() });
        let libversion = unsafe { raw_cstr((fns.libversion)()) }
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let features = fns.features();
        debug!(
            library = %name,
            version = libversion,
            features = features.bits(),
            "loaded libsqlite3"
        );
        let adapter = LibSqlite3 {
            fns,
            features,
            api_version,
            libversion,
            _lib: lib,
        };
        Ok(Box::leak(Box::new(adapter)))
    }

    /// Error for `rc`, with message and extended code read from `db`.
    fn error_from_rc(&self, rc: c_int, db: Option<NonNull<sqlite3>>) -> Error {
        let message = db
            .and_then(|db| unsafe { raw_cstr((self.fns.errmsg)(db.as_ptr())) })
            .map(|c| c.to_string_lossy().into_owned());
        let extended =
            db.and_then(|db| self.fns.extended_errcode.map(|f| unsafe { f(db.as_ptr()) }));
        Error::from_code(rc, message, extended)
    }

    /// Error for `rc` returned by a statement call, read from its connection.
    fn stmt_error(&self, rc: c_int, stmt: NonNull<sqlite3_stmt>) -> Error {
        let db = NonNull::new(unsafe { (self.fns.db_handle)(stmt.as_ptr()) });
        self.error_from_rc(rc, db)
    }

    /// Error for a failed backup call. The destination holds the message when
    /// it reports an error; otherwise the engine's text for `rc` is used.
    fn backup_error(&self, rc: c_int, dest: NonNull<sqlite3>) -> Error {
        if unsafe { (self.fns.errcode)(dest.as_ptr()) } != SQLITE_OK {
            return self.error_from_rc(rc, Some(dest));
        }
        let message = self
            .fns
            .errstr
            .and_then(|errstr| unsafe { raw_cstr(errstr(rc)) })
            .map(|c| c.to_string_lossy().into_owned());
        Error::from_code(rc, message, Some(rc))
    }

    fn check(&self, rc: c_int, db: NonNull<sqlite3>) -> Result<()> {
        if rc == SQLITE_OK {
            Ok(())
        } else {
            Err(self.error_from_rc(rc, Some(db)))
        }
    }

    fn check_stmt(&self, rc: c_int, stmt: NonNull<sqlite3_stmt>) -> Result<()> {
        if rc == SQLITE_OK {
            Ok(())
        } else {
            Err(self.stmt_error(rc, stmt))
        }
    }

    // Allocate with sqlite3_malloc so the engine can release it with sqlite3_free.
    fn alloc_copy(&self, bytes: &[u8]) -> Result<(*const c_void, sqlite3_destructor_type)> {
        if bytes.is_empty() {
            return Ok((&EMPTY_BYTE as *const u8 as *const c_void, None));
        }
        if bytes.len() > i32::MAX as usize {
            return Err(Error::with_message(ErrorCode::TooBig, "value too large"));
        }
        let ptr = unsafe { (self.fns.malloc)(bytes.len() as c_int) };
        if ptr.is_null() {
            return Err(Error::out_of_memory());
        }
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len()) };
        Ok((ptr, Some(self.fns.free)))
    }
}

fn map_open_flags(flags: OpenFlags) -> c_int {
    const MAPPING: [(OpenFlags, c_int); 9] = [
        (OpenFlags::READ_ONLY, SQLITE_OPEN_READONLY),
        (OpenFlags::READ_WRITE, SQLITE_OPEN_READWRITE),
        (OpenFlags::CREATE, SQLITE_OPEN_CREATE),
        (OpenFlags::URI, SQLITE_OPEN_URI),
        (OpenFlags::MEMORY, SQLITE_OPEN_MEMORY),
        (OpenFlags::NO_MUTEX, SQLITE_OPEN_NOMUTEX),
        (OpenFlags::FULL_MUTEX, SQLITE_OPEN_FULLMUTEX),
        (OpenFlags::SHARED_CACHE, SQLITE_OPEN_SHAREDCACHE),
        (OpenFlags::PRIVATE_CACHE, SQLITE_OPEN_PRIVATECACHE),
    ];
    MAPPING
        .iter()
        .filter(|(flag, _)| flags.contains(*flag))
        .fold(0, |out, (_, native)| out | native)
}

fn map_function_flags(flags: FunctionFlags) -> c_int {
    let mut out = SQLITE_UTF8;
    if flags.contains(FunctionFlags::DETERMINISTIC) {
        out |= SQLITE_DETERMINISTIC;
    }
    if flags.contains(FunctionFlags::DIRECT_ONLY) {
        out |= SQLITE_DIRECTONLY;
    }
    if flags.contains(FunctionFlags::INNOCUOUS) {
        out |= SQLITE_INNOCUOUS;
    }
    out
}

fn clamp_len(len: usize) -> c_int {
    if len > i32::MAX as usize {
        i32::MAX
    } else {
        len as c_int
    }
}

unsafe fn raw_cstr<'a>(ptr: *const c_char) -> Option<&'a CStr> {
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(ptr) })
    }
}

fn raw_bytes_from_cstr(cstr: &CStr) -> RawBytes {
    RawBytes {
        ptr: cstr.as_ptr() as *const u8,
        len: cstr.to_bytes().len(),
    }
}

/// Pointer to an optional C string argument, or null when absent.
fn opt_ptr(value: &Option<CString>) -> *const c_char {
    value.as_ref().map(|s| s.as_ptr()).unwrap_or(null())
}

fn drop_registration_user_data(user_data: *mut c_void, drop_user_data: Option<DestroyCallback>) {
    if let Some(drop_user_data) = drop_user_data {
        drop_user_data(user_data);
    }
}

#[cfg(test)]
mod tests {
    use super::{LoadError, map_function_flags, map_open_flags, opt_ptr};
    use std::ffi::CString;
    use sqlite_interop::{FunctionFlags, OpenFlags};

    #[test]
    fn optional_name_is_null_when_absent() {
        assert!(opt_ptr(&None).is_null());
        let name = Some(CString::new("main").unwrap());
        let ptr = opt_ptr(&name);
        assert_eq!(ptr, name.as_ref().unwrap().as_ptr());
        assert_eq!(unsafe { std::ffi::CStr::from_ptr(ptr) }.to_str().unwrap(), "main");
    }

    #[test]
    fn open_flags_map_to_native_bits() {
        assert_eq!(map_open_flags(OpenFlags::read_write_create()), 0x6);
        assert_eq!(map_open_flags(OpenFlags::READ_ONLY), 0x1);
        assert_eq!(
            map_open_flags(OpenFlags::READ_WRITE | OpenFlags::MEMORY | OpenFlags::URI),
            0x2 | 0x80 | 0x40
        );
        assert_eq!(map_open_flags(OpenFlags::empty()), 0);
    }

    #[test]
    fn function_flags_always_request_utf8() {
        assert_eq!(map_function_flags(FunctionFlags::empty()), 1);
        assert_eq!(
            map_function_flags(FunctionFlags::DETERMINISTIC | FunctionFlags::INNOCUOUS),
            1 | 0x800 | 0x20_0000
        );
    }

    #[test]
    fn load_error_lists_candidates() {
        let err = LoadError::LibraryNotFound {
            tried: vec!["a.so".into(), "b.so".into()],
        };
        assert_eq!(err.to_string(), "could not load libsqlite3, tried: a.so, b.so");
        assert_eq!(
            LoadError::MissingSymbol("sqlite3_open_v2").to_string(),
            "libsqlite3 is missing required symbol `sqlite3_open_v2`"
        );
    }
}
