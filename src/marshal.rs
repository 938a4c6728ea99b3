//! Conversions between engine memory and owned Rust values.
//!
//! Everything here is call-scoped: views are decoded into owned values before
//! the native call that produced them returns, and temporary native buffers
//! are released by `Drop` on every exit path unless explicitly handed over to
//! the engine.

use core::ffi::{CStr, c_char, c_void};
use core::ptr::NonNull;
use std::ffi::CString;

use crate::error::{Error, Result};
use crate::provider::{RawBytes, Sqlite3Api, ValueType};

/// Longest accepted function or collation name, in UTF-8 bytes.
pub const MAX_NAME_BYTES: usize = 255;

const SQLITE_NOMEM: i32 = 7;

/// Decode engine text using its reported length.
///
/// A null pointer is an absent value unless the engine reports an
/// out-of-memory condition, which is surfaced as an error.
///
/// # Safety
/// `raw` must be valid for `raw.len` bytes for the duration of this call.
pub unsafe fn decode_text(raw: RawBytes, errcode: impl FnOnce() -> i32) -> Result<Option<String>> {
    if raw.is_null() {
        return if errcode() & 0xff == SQLITE_NOMEM {
            Err(Error::out_of_memory())
        } else {
            Ok(None)
        };
    }
    let bytes = unsafe { raw.as_slice() };
    Ok(Some(String::from_utf8_lossy(bytes).into_owned()))
}

/// Decode engine bytes using their reported length.
///
/// NULL storage class maps to `None`. A null pointer for a non-NULL value is
/// a zero-length blob unless the engine reports out-of-memory.
///
/// # Safety
/// `raw` must be valid for `raw.len` bytes for the duration of this call.
pub unsafe fn decode_blob(
    raw: RawBytes,
    value_type: ValueType,
    errcode: impl FnOnce() -> i32,
) -> Result<Option<Vec<u8>>> {
    if value_type == ValueType::Null {
        return Ok(None);
    }
    if raw.is_null() {
        return if errcode() & 0xff == SQLITE_NOMEM {
            Err(Error::out_of_memory())
        } else {
            Ok(Some(Vec::new()))
        };
    }
    Ok(Some(unsafe { raw.as_slice() }.to_vec()))
}

/// Decode a NUL-terminated engine string. Null maps to `None`.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string.
pub unsafe fn decode_cstr(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

/// Call-scoped C string for an argument named `what`.
pub fn cstring(what: &str, value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| Error::misuse(format!("{what} contains NUL")))
}

/// Reject function and collation names the engine would refuse or truncate.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_BYTES {
        return Err(Error::misuse(format!("invalid function name: '{name}'")));
    }
    Ok(())
}

/// Buffer allocated from the engine's allocator.
///
/// Freed on drop. [`NativeBuf::into_raw`] hands ownership to the engine for
/// calls that adopt the allocation.
pub struct NativeBuf<'p, P: Sqlite3Api> {
    api: &'p P,
    ptr: NonNull<u8>,
    len: usize,
}

impl<'p, P: Sqlite3Api> NativeBuf<'p, P> {
    /// Copy `bytes` into a fresh engine allocation.
    pub fn copy_from(api: &'p P, bytes: &[u8]) -> Result<Self> {
        // malloc(0) may legitimately return null
        let size = bytes.len().max(1);
        let raw = unsafe { api.malloc(size) } as *mut u8;
        let ptr = NonNull::new(raw).ok_or_else(Error::out_of_memory)?;
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len()) };
        Ok(Self {
            api,
            ptr,
            len: bytes.len(),
        })
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the payload.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Give up ownership; the caller becomes responsible for the allocation.
    pub fn into_raw(self) -> (NonNull<u8>, usize) {
        let me = core::mem::ManuallyDrop::new(self);
        (me.ptr, me.len)
    }
}

impl<P: Sqlite3Api> Drop for NativeBuf<'_, P> {
    fn drop(&mut self) {
        unsafe { self.api.free(self.ptr.as_ptr() as *mut c_void) };
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_blob, decode_cstr, decode_text, validate_name};
    use crate::error::ErrorCode;
    use crate::provider::{RawBytes, ValueType};

    #[test]
    fn null_text_is_absent_unless_out_of_memory() {
        let absent = unsafe { decode_text(RawBytes::null(), || 0) }.unwrap();
        assert_eq!(absent, None);
        let oom = unsafe { decode_text(RawBytes::null(), || 7) }.unwrap_err();
        assert_eq!(oom.code, ErrorCode::NoMem);
        assert_eq!(oom.to_string(), "Out of memory");
    }

    #[test]
    fn blob_null_pointer_rules() {
        let null_type = unsafe { decode_blob(RawBytes::null(), ValueType::Null, || 7) }.unwrap();
        assert_eq!(null_type, None);
        let empty = unsafe { decode_blob(RawBytes::null(), ValueType::Blob, || 0) }.unwrap();
        assert_eq!(empty, Some(Vec::new()));
        // extended SQLITE_IOERR_NOMEM still reports the primary NOMEM byte
        let oom = unsafe { decode_blob(RawBytes::null(), ValueType::Blob, || (12 << 8) | 7) };
        assert_eq!(oom.unwrap_err().code, ErrorCode::NoMem);
    }

    #[test]
    fn blob_uses_reported_length() {
        let bytes = [1_u8, 0, 2, 0];
        let raw = RawBytes {
            ptr: bytes.as_ptr(),
            len: 3,
        };
        let out = unsafe { decode_blob(raw, ValueType::Blob, || 0) }.unwrap();
        assert_eq!(out, Some(vec![1, 0, 2]));
    }

    #[test]
    fn cstr_null_is_none() {
        assert_eq!(unsafe { decode_cstr(core::ptr::null()) }, None);
        assert_eq!(unsafe { decode_cstr(c"main".as_ptr()) }, Some("main".into()));
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("lower").is_ok());
        assert!(validate_name(&"x".repeat(255)).is_ok());
        let err = validate_name("").unwrap_err();
        assert_eq!(err.to_string(), "invalid function name: ''");
        assert!(validate_name(&"x".repeat(256)).is_err());
        // 128 two-byte characters exceed the byte limit
        assert!(validate_name(&"é".repeat(128)).is_err());
    }
}
