use crate::provider::{RawBytes, ValueType};

/// Owned value that has crossed the native boundary.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    /// SQL NULL.
    #[default]
    Null,
    /// 64-bit integer.
    Integer(i64),
    /// Double.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Bytes.
    Blob(Vec<u8>),
}

impl Value {
    /// Storage class of this value.
    pub fn value_type(&self) -> ValueType {
        self.as_ref().value_type()
    }

    /// Borrowed view of this value.
    pub fn as_ref(&self) -> ValueRef<'_> {
        match self {
            Value::Null => ValueRef::Null,
            Value::Integer(v) => ValueRef::Integer(*v),
            Value::Float(v) => ValueRef::Float(*v),
            Value::Text(v) => ValueRef::Text(v),
            Value::Blob(v) => ValueRef::Blob(v),
        }
    }

    /// Integer payload.
    pub fn as_i64(&self) -> Option<i64> {
        self.as_ref().as_i64()
    }

    /// Text payload.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value.into())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Integer(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Blob(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Value borrowed from engine memory for the extent of one native call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ValueRef<'a> {
    /// SQL NULL.
    Null,
    /// 64-bit integer.
    Integer(i64),
    /// Double.
    Float(f64),
    /// UTF-8 text.
    Text(&'a str),
    /// Bytes.
    Blob(&'a [u8]),
}

impl<'a> ValueRef<'a> {
    /// Storage class of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            ValueRef::Null => ValueType::Null,
            ValueRef::Integer(_) => ValueType::Integer,
            ValueRef::Float(_) => ValueType::Float,
            ValueRef::Text(_) => ValueType::Text,
            ValueRef::Blob(_) => ValueType::Blob,
        }
    }

    /// Integer payload.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ValueRef::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric payload widened to a double.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ValueRef::Float(v) => Some(*v),
            ValueRef::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Text payload.
    pub fn as_str(&self) -> Option<&'a str> {
        match self {
            ValueRef::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Blob payload.
    pub fn as_blob(&self) -> Option<&'a [u8]> {
        match self {
            ValueRef::Blob(v) => Some(v),
            _ => None,
        }
    }

    /// Copy into an owned [`Value`].
    pub fn to_owned(&self) -> Value {
        match *self {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(v) => Value::Integer(v),
            ValueRef::Float(v) => Value::Float(v),
            ValueRef::Text(v) => Value::Text(v.to_owned()),
            ValueRef::Blob(v) => Value::Blob(v.to_vec()),
        }
    }

    /// # Safety
    /// `raw` must stay valid for `'a`.
    ///
    /// Bytes that are not valid UTF-8 come back as `Blob` instead of being
    /// reinterpreted.
    pub unsafe fn from_raw_text(raw: RawBytes) -> ValueRef<'a> {
        let bytes = unsafe { raw.as_slice() };
        match core::str::from_utf8(bytes) {
            Ok(text) => ValueRef::Text(text),
            Err(_) => ValueRef::Blob(bytes),
        }
    }

    /// # Safety
    /// `raw` must stay valid for `'a`.
    pub unsafe fn from_raw_blob(raw: RawBytes) -> ValueRef<'a> {
        ValueRef::Blob(unsafe { raw.as_slice() })
    }
}
