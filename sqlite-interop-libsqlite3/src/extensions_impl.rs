use super::*;
use sqlite_interop::{
    BackupStep, ColumnMetadata, DeserializeFlags, OwnedBytes, Sqlite3Backup, Sqlite3Hooks,
    Sqlite3Metadata, Sqlite3Serialize,
};

#[allow(unsafe_op_in_unsafe_fn)]
unsafe impl Sqlite3Hooks for LibSqlite3 {
    unsafe fn busy_timeout(&self, db: NonNull<Self::Db>, ms: i32) -> Result<()> {
        let rc = (self.fns.busy_timeout)(db.as_ptr(), ms);
        self.check(rc, db)
    }

    unsafe fn busy_handler(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<BusyCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        let rc = (self.fns.busy_handler)(db.as_ptr(), callback, context);
        self.check(rc, db)
    }

    unsafe fn progress_handler(
        &self,
        db: NonNull<Self::Db>,
        n_ops: i32,
        callback: Option<ProgressCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        (self.fns.progress_handler)(db.as_ptr(), n_ops, callback, context);
        Ok(())
    }

    unsafe fn commit_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<CommitCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        // The previous context comes back here; its owner releases it.
        (self.fns.commit_hook)(db.as_ptr(), callback, context);
        Ok(())
    }

    unsafe fn rollback_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<RollbackCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        (self.fns.rollback_hook)(db.as_ptr(), callback, context);
        Ok(())
    }

    unsafe fn update_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<UpdateCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        (self.fns.update_hook)(db.as_ptr(), callback, context);
        Ok(())
    }
}

/// A native backup paired with the connection receiving its pages, which is
/// where the engine reports step and finish failures.
pub struct BackupHandle {
    raw: NonNull<sqlite3_backup>,
    dest: NonNull<sqlite3>,
}

#[allow(unsafe_op_in_unsafe_fn)]
unsafe impl Sqlite3Backup for LibSqlite3 {
    type Backup = BackupHandle;

    unsafe fn backup_init(
        &self,
        dest_db: NonNull<Self::Db>,
        dest_name: &str,
        source_db: NonNull<Self::Db>,
        source_name: &str,
    ) -> Result<NonNull<Self::Backup>> {
        let Some(backup_init) = self.fns.backup_init else {
            return Err(Error::feature_unavailable("backup_init not available"));
        };
        let dest_name = c_arg("dest name", dest_name)?;
        let source_name = c_arg("source name", source_name)?;
        let backup = backup_init(
            dest_db.as_ptr(),
            dest_name.as_ptr(),
            source_db.as_ptr(),
            source_name.as_ptr(),
        );
        match NonNull::new(backup) {
            Some(raw) => {
                let handle = Box::new(BackupHandle { raw, dest: dest_db });
                Ok(NonNull::from(Box::leak(handle)))
            }
            None => {
                let rc = (self.fns.errcode)(dest_db.as_ptr());
                Err(self.error_from_rc(rc, Some(dest_db)))
            }
        }
    }

    unsafe fn backup_step(&self, backup: NonNull<Self::Backup>, pages: i32) -> Result<BackupStep> {
        let Some(backup_step) = self.fns.backup_step else {
            return Err(Error::feature_unavailable("backup_step not available"));
        };
        let handle = backup.as_ref();
        match backup_step(handle.raw.as_ptr(), pages) {
            SQLITE_OK => Ok(BackupStep::More),
            SQLITE_DONE => Ok(BackupStep::Done),
            rc => Err(self.backup_error(rc, handle.dest)),
        }
    }

    unsafe fn backup_remaining(&self, backup: NonNull<Self::Backup>) -> i32 {
        self.fns
            .backup_remaining
            .map(|f| f(backup.as_ref().raw.as_ptr()))
            .unwrap_or(0)
    }

    unsafe fn backup_pagecount(&self, backup: NonNull<Self::Backup>) -> i32 {
        self.fns
            .backup_pagecount
            .map(|f| f(backup.as_ref().raw.as_ptr()))
            .unwrap_or(0)
    }

    unsafe fn backup_finish(&self, backup: NonNull<Self::Backup>) -> Result<()> {
        let Some(backup_finish) = self.fns.backup_finish else {
            return Err(Error::feature_unavailable("backup_finish not available"));
        };
        let handle = Box::from_raw(backup.as_ptr());
        match backup_finish(handle.raw.as_ptr()) {
            SQLITE_OK => Ok(()),
            // Finish stores its result code on the destination connection.
            rc => Err(self.error_from_rc(rc, Some(handle.dest))),
        }
    }
}

fn map_deserialize_flags(flags: DeserializeFlags) -> u32 {
    let mut out = 0;
    if flags.contains(DeserializeFlags::FREE_ON_CLOSE) {
        out |= SQLITE_DESERIALIZE_FREEONCLOSE;
    }
    if flags.contains(DeserializeFlags::RESIZEABLE) {
        out |= SQLITE_DESERIALIZE_RESIZEABLE;
    }
    if flags.contains(DeserializeFlags::READ_ONLY) {
        out |= SQLITE_DESERIALIZE_READONLY;
    }
    out
}

#[allow(unsafe_op_in_unsafe_fn)]
unsafe impl Sqlite3Serialize for LibSqlite3 {
    unsafe fn serialize_borrowed(
        &self,
        db: NonNull<Self::Db>,
        schema: &str,
    ) -> Result<Option<RawBytes>> {
        let Some(serialize) = self.fns.serialize else {
            return Err(Error::feature_unavailable("serialize not available"));
        };
        let schema = c_arg("schema", schema)?;
        let mut len: i64 = 0;
        let ptr = serialize(
            db.as_ptr(),
            schema.as_ptr(),
            &mut len,
            SQLITE_SERIALIZE_NOCOPY,
        );
        // Null means the image is not held in one contiguous buffer.
        if ptr.is_null() {
            return Ok(None);
        }
        Ok(Some(RawBytes {
            ptr,
            len: usize::try_from(len).unwrap_or(0),
        }))
    }

    unsafe fn serialize(&self, db: NonNull<Self::Db>, schema: &str) -> Result<Option<OwnedBytes>> {
        let Some(serialize) = self.fns.serialize else {
            return Err(Error::feature_unavailable("serialize not available"));
        };
        let schema = c_arg("schema", schema)?;
        let mut len: i64 = -1;
        let ptr = serialize(db.as_ptr(), schema.as_ptr(), &mut len, 0);
        if let Some(ptr) = NonNull::new(ptr) {
            let len = match usize::try_from(len) {
                Ok(len) => len,
                Err(_) => {
                    (self.fns.free)(ptr.as_ptr() as *mut c_void);
                    return Err(Error::with_message(
                        ErrorCode::TooBig,
                        "serialized image length out of range",
                    ));
                }
            };
            return Ok(Some(OwnedBytes { ptr, len }));
        }
        if len != 0 {
            return Ok(None);
        }
        // Zero pages: the size is reported but nothing is allocated.
        let empty = NonNull::new((self.fns.malloc)(1) as *mut u8);
        Ok(empty.map(|ptr| OwnedBytes { ptr, len: 0 }))
    }

    unsafe fn deserialize(
        &self,
        db: NonNull<Self::Db>,
        schema: &str,
        data: NonNull<u8>,
        len: usize,
        flags: DeserializeFlags,
    ) -> Result<()> {
        let owned = flags.contains(DeserializeFlags::FREE_ON_CLOSE);
        let release = || {
            if owned {
                unsafe { (self.fns.free)(data.as_ptr() as *mut c_void) };
            }
        };
        let Some(deserialize) = self.fns.deserialize else {
            release();
            return Err(Error::feature_unavailable("deserialize not available"));
        };
        let schema = match c_arg("schema", schema) {
            Ok(schema) => schema,
            Err(err) => {
                release();
                return Err(err);
            }
        };
        let Ok(size) = i64::try_from(len) else {
            release();
            return Err(Error::with_message(
                ErrorCode::TooBig,
                "database image too large",
            ));
        };
        // From here on the engine frees `data` on failure as well.
        let rc = deserialize(
            db.as_ptr(),
            schema.as_ptr(),
            data.as_ptr(),
            size,
            size,
            map_deserialize_flags(flags),
        );
        self.check(rc, db)
    }

    unsafe fn set_size_limit(
        &self,
        db: NonNull<Self::Db>,
        schema: &str,
        limit: i64,
    ) -> Result<i64> {
        let Some(file_control) = self.fns.file_control else {
            return Err(Error::feature_unavailable("file_control not available"));
        };
        let schema = c_arg("schema", schema)?;
        let mut value = limit;
        let rc = file_control(
            db.as_ptr(),
            schema.as_ptr(),
            SQLITE_FCNTL_SIZE_LIMIT,
            &mut value as *mut i64 as *mut c_void,
        );
        self.check(rc, db)?;
        Ok(value)
    }

    unsafe fn free_image(&self, bytes: OwnedBytes) {
        (self.fns.free)(bytes.ptr.as_ptr() as *mut c_void);
    }
}

#[allow(unsafe_op_in_unsafe_fn)]
unsafe impl Sqlite3Metadata for LibSqlite3 {
    unsafe fn table_column_metadata(
        &self,
        db: NonNull<Self::Db>,
        db_name: Option<&str>,
        table: &str,
        column: &str,
    ) -> Result<ColumnMetadata> {
        let Some(func) = self.fns.table_column_metadata else {
            return Err(Error::feature_unavailable(
                "table_column_metadata not available",
            ));
        };
        let table = c_arg("table", table)?;
        let column = c_arg("column", column)?;
        let db_name = db_name.map(|name| c_arg("db name", name)).transpose()?;
        let mut data_type = null();
        let mut coll_seq = null();
        let mut not_null = 0;
        let mut primary_key = 0;
        let mut autoinc = 0;
        let rc = func(
            db.as_ptr(),
            opt_ptr(&db_name),
            table.as_ptr(),
            column.as_ptr(),
            &mut data_type,
            &mut coll_seq,
            &mut not_null,
            &mut primary_key,
            &mut autoinc,
        );
        self.check(rc, db)?;
        Ok(ColumnMetadata {
            data_type: raw_cstr(data_type).map(raw_bytes_from_cstr),
            coll_seq: raw_cstr(coll_seq).map(raw_bytes_from_cstr),
            not_null: not_null != 0,
            primary_key: primary_key != 0,
            autoinc: autoinc != 0,
        })
    }

    unsafe fn column_table_name(&self, stmt: NonNull<Self::Stmt>, col: i32) -> Option<RawBytes> {
        let func = self.fns.column_table_name?;
        raw_cstr(func(stmt.as_ptr(), col)).map(raw_bytes_from_cstr)
    }

    unsafe fn column_origin_name(&self, stmt: NonNull<Self::Stmt>, col: i32) -> Option<RawBytes> {
        let func = self.fns.column_origin_name?;
        raw_cstr(func(stmt.as_ptr(), col)).map(raw_bytes_from_cstr)
    }
}
