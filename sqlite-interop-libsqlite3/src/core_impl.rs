use super::*;
use sqlite_interop::{OpenOptions, Sqlite3Api, StepResult, ValueType};

fn registration_name_or_drop(
    what: &str,
    name: &str,
    user_data: *mut c_void,
    drop_user_data: Option<DestroyCallback>,
) -> Result<CString> {
    c_arg(what, name).inspect_err(|_| drop_registration_user_data(user_data, drop_user_data))
}

impl LibSqlite3 {
    fn prepare_with(
        &self,
        db: NonNull<sqlite3>,
        sql: &str,
        prepare: impl FnOnce(*const c_char, c_int, *mut *mut sqlite3_stmt) -> c_int,
    ) -> Result<NonNull<sqlite3_stmt>> {
        if sql.len() > i32::MAX as usize {
            return Err(Error::with_message(ErrorCode::TooBig, "SQL text too long"));
        }
        let mut stmt = null_mut();
        let rc = prepare(sql.as_ptr() as *const c_char, sql.len() as c_int, &mut stmt);
        if rc != SQLITE_OK {
            return Err(self.error_from_rc(rc, Some(db)));
        }
        // Whitespace or comments only: the engine succeeds without a statement.
        NonNull::new(stmt).ok_or_else(|| Error::misuse("no SQL statement to prepare"))
    }

    fn text_view(&self, ptr: *const u8, len: c_int) -> RawBytes {
        if ptr.is_null() {
            return RawBytes::null();
        }
        RawBytes {
            ptr,
            len: len.max(0) as usize,
        }
    }
}

#[allow(unsafe_op_in_unsafe_fn)]
unsafe impl Sqlite3Api for LibSqlite3 {
    type Db = sqlite3;
    type Stmt = sqlite3_stmt;
    type Value = sqlite3_value;
    type Context = sqlite3_context;

    fn api_version(&self) -> ApiVersion {
        self.api_version
    }

    fn feature_set(&self) -> FeatureSet {
        self.features
    }

    fn backend_name(&self) -> &'static str {
        "libsqlite3"
    }

    fn backend_version(&self) -> Option<ApiVersion> {
        Some(self.api_version)
    }

    fn libversion(&self) -> &'static str {
        self.libversion
    }

    unsafe fn malloc(&self, size: usize) -> *mut c_void {
        match self.fns.malloc64 {
            Some(malloc64) => malloc64(size as u64),
            None if size <= i32::MAX as usize => (self.fns.malloc)(size as c_int),
            None => null_mut(),
        }
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        (self.fns.free)(ptr);
    }

    unsafe fn open(&self, filename: &str, options: OpenOptions<'_>) -> Result<NonNull<Self::Db>> {
        let filename = c_arg("filename", filename)?;
        let vfs = options.vfs.map(|vfs| c_arg("vfs", vfs)).transpose()?;
        let mut db = null_mut();
        let rc = (self.fns.open_v2)(
            filename.as_ptr(),
            &mut db,
            map_open_flags(options.flags),
            opt_ptr(&vfs),
        );
        if rc == SQLITE_OK && !db.is_null() {
            return Ok(NonNull::new_unchecked(db));
        }
        // Read the diagnostics before releasing the half-open handle.
        let err = match NonNull::new(db) {
            Some(handle) => self.error_from_rc(rc, Some(handle)),
            None => Error::from_code(if rc == SQLITE_OK { SQLITE_NOMEM } else { rc }, None, None),
        };
        if !db.is_null() {
            (self.fns.close)(db);
        }
        Err(err)
    }

    unsafe fn close(&self, db: NonNull<Self::Db>) -> Result<()> {
        let rc = (self.fns.close)(db.as_ptr());
        self.check(rc, db)
    }

    unsafe fn extended_result_codes(&self, db: NonNull<Self::Db>, on: bool) -> Result<()> {
        let rc = (self.fns.extended_result_codes)(db.as_ptr(), on as c_int);
        self.check(rc, db)
    }

    unsafe fn interrupt(&self, db: NonNull<Self::Db>) {
        (self.fns.interrupt)(db.as_ptr());
    }

    unsafe fn exec(&self, db: NonNull<Self::Db>, sql: &str) -> Result<()> {
        let sql = c_arg("SQL", sql)?;
        let mut errmsg = null_mut();
        let rc = (self.fns.exec)(db.as_ptr(), sql.as_ptr(), None, null_mut(), &mut errmsg);
        if rc == SQLITE_OK {
            return Ok(());
        }
        let mut err = self.error_from_rc(rc, Some(db));
        if let Some(msg) = raw_cstr(errmsg) {
            err.message = Some(msg.to_string_lossy().into_owned());
        }
        if !errmsg.is_null() {
            (self.fns.free)(errmsg as *mut c_void);
        }
        Err(err)
    }

    unsafe fn prepare_v2(&self, db: NonNull<Self::Db>, sql: &str) -> Result<NonNull<Self::Stmt>> {
        self.prepare_with(db, sql, |ptr, len, out| {
            unsafe { (self.fns.prepare_v2)(db.as_ptr(), ptr, len, out, null_mut()) }
        })
    }

    unsafe fn prepare_v3(
        &self,
        db: NonNull<Self::Db>,
        sql: &str,
        flags: u32,
    ) -> Result<NonNull<Self::Stmt>> {
        let Some(prepare) = self.fns.prepare_v3 else {
            return Err(Error::feature_unavailable("prepare_v3 not available"));
        };
        self.prepare_with(db, sql, |ptr, len, out| {
            unsafe { prepare(db.as_ptr(), ptr, len, flags, out, null_mut()) }
        })
    }

    unsafe fn step(&self, stmt: NonNull<Self::Stmt>) -> Result<StepResult> {
        match (self.fns.step)(stmt.as_ptr()) {
            SQLITE_ROW => Ok(StepResult::Row),
            SQLITE_DONE => Ok(StepResult::Done),
            rc => Err(self.stmt_error(rc, stmt)),
        }
    }

    unsafe fn reset(&self, stmt: NonNull<Self::Stmt>) -> Result<()> {
        let rc = (self.fns.reset)(stmt.as_ptr());
        self.check_stmt(rc, stmt)
    }

    unsafe fn finalize(&self, stmt: NonNull<Self::Stmt>) -> Result<()> {
        // The statement is gone after this call; read the error from its connection first.
        let db = NonNull::new((self.fns.db_handle)(stmt.as_ptr()));
        let rc = (self.fns.finalize)(stmt.as_ptr());
        if rc == SQLITE_OK {
            Ok(())
        } else {
            Err(self.error_from_rc(rc, db))
        }
    }

    unsafe fn clear_bindings(&self, stmt: NonNull<Self::Stmt>) -> Result<()> {
        let rc = (self.fns.clear_bindings)(stmt.as_ptr());
        self.check_stmt(rc, stmt)
    }

    unsafe fn bind_parameter_count(&self, stmt: NonNull<Self::Stmt>) -> i32 {
        (self.fns.bind_parameter_count)(stmt.as_ptr())
    }

    unsafe fn bind_null(&self, stmt: NonNull<Self::Stmt>, idx: i32) -> Result<()> {
        let rc = (self.fns.bind_null)(stmt.as_ptr(), idx);
        self.check_stmt(rc, stmt)
    }

    unsafe fn bind_int(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: i32) -> Result<()> {
        let rc = (self.fns.bind_int)(stmt.as_ptr(), idx, v);
        self.check_stmt(rc, stmt)
    }

    unsafe fn bind_int64(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: i64) -> Result<()> {
        let rc = (self.fns.bind_int64)(stmt.as_ptr(), idx, v);
        self.check_stmt(rc, stmt)
    }

    unsafe fn bind_double(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: f64) -> Result<()> {
        let rc = (self.fns.bind_double)(stmt.as_ptr(), idx, v);
        self.check_stmt(rc, stmt)
    }

    unsafe fn bind_text(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: &str) -> Result<()> {
        let (ptr, dtor) = self.alloc_copy(v.as_bytes())?;
        // The engine runs `dtor` itself, also when binding fails.
        let rc = (self.fns.bind_text)(
            stmt.as_ptr(),
            idx,
            ptr as *const c_char,
            clamp_len(v.len()),
            dtor,
        );
        self.check_stmt(rc, stmt)
    }

    unsafe fn bind_blob(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: &[u8]) -> Result<()> {
        let (ptr, dtor) = self.alloc_copy(v)?;
        let rc = (self.fns.bind_blob)(stmt.as_ptr(), idx, ptr, clamp_len(v.len()), dtor);
        self.check_stmt(rc, stmt)
    }

    unsafe fn column_count(&self, stmt: NonNull<Self::Stmt>) -> i32 {
        (self.fns.column_count)(stmt.as_ptr())
    }

    unsafe fn column_type(&self, stmt: NonNull<Self::Stmt>, col: i32) -> ValueType {
        ValueType::from_code((self.fns.column_type)(stmt.as_ptr(), col))
    }

    unsafe fn column_int(&self, stmt: NonNull<Self::Stmt>, col: i32) -> i32 {
        (self.fns.column_int)(stmt.as_ptr(), col)
    }

    unsafe fn column_int64(&self, stmt: NonNull<Self::Stmt>, col: i32) -> i64 {
        (self.fns.column_int64)(stmt.as_ptr(), col)
    }

    unsafe fn column_double(&self, stmt: NonNull<Self::Stmt>, col: i32) -> f64 {
        (self.fns.column_double)(stmt.as_ptr(), col)
    }

    unsafe fn column_text(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes {
        // Pointer first, then length: the text conversion may change the byte count.
        let ptr = (self.fns.column_text)(stmt.as_ptr(), col) as *const u8;
        let len = (self.fns.column_bytes)(stmt.as_ptr(), col);
        self.text_view(ptr, len)
    }

    unsafe fn column_blob(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes {
        let ptr = (self.fns.column_blob)(stmt.as_ptr(), col) as *const u8;
        let len = (self.fns.column_bytes)(stmt.as_ptr(), col);
        self.text_view(ptr, len)
    }

    unsafe fn column_name(&self, stmt: NonNull<Self::Stmt>, col: i32) -> Option<RawBytes> {
        raw_cstr((self.fns.column_name)(stmt.as_ptr(), col)).map(raw_bytes_from_cstr)
    }

    unsafe fn column_decltype(&self, stmt: NonNull<Self::Stmt>, col: i32) -> Option<RawBytes> {
        raw_cstr((self.fns.column_decltype)(stmt.as_ptr(), col)).map(raw_bytes_from_cstr)
    }

    unsafe fn errcode(&self, db: NonNull<Self::Db>) -> i32 {
        (self.fns.errcode)(db.as_ptr())
    }

    unsafe fn errmsg(&self, db: NonNull<Self::Db>) -> *const c_char {
        (self.fns.errmsg)(db.as_ptr())
    }

    unsafe fn extended_errcode(&self, db: NonNull<Self::Db>) -> Option<i32> {
        self.fns.extended_errcode.map(|f| f(db.as_ptr()))
    }

    unsafe fn changes(&self, db: NonNull<Self::Db>) -> i64 {
        match self.fns.changes64 {
            Some(changes64) => changes64(db.as_ptr()),
            None => i64::from((self.fns.changes)(db.as_ptr())),
        }
    }

    unsafe fn total_changes(&self, db: NonNull<Self::Db>) -> i64 {
        match self.fns.total_changes64 {
            Some(total_changes64) => total_changes64(db.as_ptr()),
            None => i64::from((self.fns.total_changes)(db.as_ptr())),
        }
    }

    unsafe fn limit(&self, db: NonNull<Self::Db>, id: i32, value: i32) -> i32 {
        (self.fns.limit)(db.as_ptr(), id, value)
    }

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
    ) -> Result<()> {
        let name = registration_name_or_drop("function name", name, user_data, drop_user_data)?;
        // The engine runs `drop_user_data` itself when registration fails.
        let rc = (self.fns.create_function_v2)(
            db.as_ptr(),
            name.as_ptr(),
            n_args,
            map_function_flags(flags),
            user_data,
            x_func,
            x_step,
            x_final,
            drop_user_data,
        );
        self.check(rc, db)
    }

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
    ) -> Result<()> {
        let Some(create) = self.fns.create_window_function else {
            drop_registration_user_data(user_data, drop_user_data);
            return Err(Error::feature_unavailable(
                "create_window_function not available",
            ));
        };
        let name = registration_name_or_drop("function name", name, user_data, drop_user_data)?;
        let rc = create(
            db.as_ptr(),
            name.as_ptr(),
            n_args,
            map_function_flags(flags),
            user_data,
            x_step,
            x_final,
            x_value,
            x_inverse,
            drop_user_data,
        );
        self.check(rc, db)
    }

    unsafe fn create_collation_v2(
        &self,
        db: NonNull<Self::Db>,
        name: &str,
        context: *mut c_void,
        cmp: Option<CompareCallback>,
        destroy: Option<DestroyCallback>,
    ) -> Result<()> {
        let name = registration_name_or_drop("collation name", name, context, destroy)?;
        let rc = (self.fns.create_collation_v2)(
            db.as_ptr(),
            name.as_ptr(),
            SQLITE_UTF8,
            context,
            cmp,
            destroy,
        );
        if rc == SQLITE_OK {
            return Ok(());
        }
        // Unlike functions, a failed collation registration leaves `context` with the caller.
        let err = self.error_from_rc(rc, Some(db));
        drop_registration_user_data(context, destroy);
        Err(err)
    }

    unsafe fn aggregate_context(&self, ctx: NonNull<Self::Context>, bytes: usize) -> *mut c_void {
        (self.fns.aggregate_context)(ctx.as_ptr(), clamp_len(bytes))
    }

    unsafe fn result_null(&self, ctx: NonNull<Self::Context>) {
        (self.fns.result_null)(ctx.as_ptr());
    }

    unsafe fn result_int64(&self, ctx: NonNull<Self::Context>, v: i64) {
        (self.fns.result_int64)(ctx.as_ptr(), v);
    }

    unsafe fn result_double(&self, ctx: NonNull<Self::Context>, v: f64) {
        (self.fns.result_double)(ctx.as_ptr(), v);
    }

    unsafe fn result_text(&self, ctx: NonNull<Self::Context>, v: &str) {
        match self.alloc_copy(v.as_bytes()) {
            Ok((ptr, dtor)) => {
                (self.fns.result_text)(ctx.as_ptr(), ptr as *const c_char, clamp_len(v.len()), dtor)
            }
            Err(err) => self.result_error(ctx, &err.to_string()),
        }
    }

    unsafe fn result_blob(&self, ctx: NonNull<Self::Context>, v: &[u8]) {
        match self.alloc_copy(v) {
            Ok((ptr, dtor)) => (self.fns.result_blob)(ctx.as_ptr(), ptr, clamp_len(v.len()), dtor),
            Err(err) => self.result_error(ctx, &err.to_string()),
        }
    }

    unsafe fn result_error(&self, ctx: NonNull<Self::Context>, msg: &str) {
        // Explicit length: `msg` needs no terminator and the engine copies it.
        (self.fns.result_error)(ctx.as_ptr(), msg.as_ptr() as *const c_char, clamp_len(msg.len()));
    }

    unsafe fn user_data(ctx: NonNull<Self::Context>) -> *mut c_void {
        match LIBRARY.get() {
            Some(Ok(lib)) => (lib.fns.user_data)(ctx.as_ptr()),
            _ => null_mut(),
        }
    }

    unsafe fn value_type(&self, v: NonNull<Self::Value>) -> ValueType {
        ValueType::from_code((self.fns.value_type)(v.as_ptr()))
    }

    unsafe fn value_int(&self, v: NonNull<Self::Value>) -> i32 {
        (self.fns.value_int64)(v.as_ptr()) as i32
    }

    unsafe fn value_int64(&self, v: NonNull<Self::Value>) -> i64 {
        (self.fns.value_int64)(v.as_ptr())
    }

    unsafe fn value_double(&self, v: NonNull<Self::Value>) -> f64 {
        (self.fns.value_double)(v.as_ptr())
    }

    unsafe fn value_text(&self, v: NonNull<Self::Value>) -> RawBytes {
        let ptr = (self.fns.value_text)(v.as_ptr()) as *const u8;
        let len = (self.fns.value_bytes)(v.as_ptr());
        self.text_view(ptr, len)
    }

    unsafe fn value_blob(&self, v: NonNull<Self::Value>) -> RawBytes {
        let ptr = (self.fns.value_blob)(v.as_ptr()) as *const u8;
        let len = (self.fns.value_bytes)(v.as_ptr());
        self.text_view(ptr, len)
    }

    unsafe fn enable_load_extension(&self, db: NonNull<Self::Db>, on: bool) -> Result<()> {
        let Some(enable) = self.fns.enable_load_extension else {
            return Err(Error::feature_unavailable(
                "enable_load_extension not available",
            ));
        };
        let rc = enable(db.as_ptr(), on as c_int);
        self.check(rc, db)
    }

    fn enable_shared_cache(&self, on: bool) -> Result<()> {
        let Some(enable) = self.fns.enable_shared_cache else {
            return Err(Error::feature_unavailable(
                "enable_shared_cache not available",
            ));
        };
        match unsafe { enable(on as c_int) } {
            SQLITE_OK => Ok(()),
            rc => Err(Error::from_code(rc, None, None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{drop_registration_user_data, registration_name_or_drop};
    use sqlite_interop::ErrorCode;
    use std::ffi::c_void;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DROP_CALLS: AtomicUsize = AtomicUsize::new(0);
    static DROP_TEST_LOCK: Mutex<()> = Mutex::new(());

    extern "C" fn drop_counting_box(ptr: *mut c_void) {
        DROP_CALLS.fetch_add(1, Ordering::SeqCst);
        if !ptr.is_null() {
            unsafe { drop(Box::from_raw(ptr as *mut usize)) };
        }
    }

    #[test]
    fn interior_nul_drops_user_data() {
        let _guard = DROP_TEST_LOCK
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        DROP_CALLS.store(0, Ordering::SeqCst);
        let user_data = Box::into_raw(Box::new(7usize)) as *mut c_void;
        let err = registration_name_or_drop(
            "function name",
            "bad\0name",
            user_data,
            Some(drop_counting_box),
        )
        .expect_err("interior NUL should fail");
        assert_eq!(err.code, ErrorCode::Misuse);
        assert_eq!(err.to_string(), "function name contains NUL");
        assert_eq!(DROP_CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn valid_name_keeps_user_data() {
        let _guard = DROP_TEST_LOCK
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        DROP_CALLS.store(0, Ordering::SeqCst);
        let user_data = Box::into_raw(Box::new(9usize)) as *mut c_void;
        let name = registration_name_or_drop(
            "collation name",
            "nocase2",
            user_data,
            Some(drop_counting_box),
        )
        .expect("valid name should pass");
        assert_eq!(name.to_str().unwrap(), "nocase2");
        assert_eq!(DROP_CALLS.load(Ordering::SeqCst), 0);
        drop_registration_user_data(user_data, Some(drop_counting_box));
        assert_eq!(DROP_CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_without_callback_is_noop() {
        drop_registration_user_data(std::ptr::null_mut(), None);
    }
}
