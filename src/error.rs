/// Structured failure reported by the interop layer.
///
/// Misuse conditions (closed handles, bad indices, invalid names) are detected
/// before any native call and carry a fixed message. Native failures carry the
/// engine's primary code, its extended code when available, and the message
/// fetched while the owning handle was still valid.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{}", describe(.code, .message))]
pub struct Error {
    /// Primary result code.
    pub code: ErrorCode,
    /// Extended result code reported by the engine, if any.
    pub extended: Option<i32>,
    /// Human-readable message from the engine or from this crate.
    pub message: Option<String>,
}

/// Result alias used across the crate.
pub type Result<T> = core::result::Result<T, Error>;

pub(crate) const DB_CLOSED: &str = "The database has been closed";
pub(crate) const DB_ALREADY_OPEN: &str = "DB already open";
pub(crate) const STMT_CLOSED: &str = "stmt pointer is closed";
pub(crate) const OUT_OF_MEMORY: &str = "Out of memory";

/// Engine result codes plus conditions raised by this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// `SQLITE_OK`.
    Ok,
    /// `SQLITE_ERROR`: generic failure.
    Error,
    /// `SQLITE_INTERNAL`.
    Internal,
    /// `SQLITE_PERM`.
    Perm,
    /// `SQLITE_ABORT`.
    Abort,
    /// `SQLITE_BUSY`: the database file is locked by another connection.
    Busy,
    /// `SQLITE_LOCKED`: a table is locked within this connection.
    Locked,
    /// `SQLITE_NOMEM`.
    NoMem,
    /// `SQLITE_READONLY`.
    ReadOnly,
    /// `SQLITE_INTERRUPT`.
    Interrupt,
    /// `SQLITE_IOERR`.
    IoErr,
    /// `SQLITE_CORRUPT`.
    Corrupt,
    /// `SQLITE_NOTFOUND`.
    NotFound,
    /// `SQLITE_FULL`.
    Full,
    /// `SQLITE_CANTOPEN`.
    CantOpen,
    /// `SQLITE_PROTOCOL`.
    Protocol,
    /// `SQLITE_EMPTY`.
    Empty,
    /// `SQLITE_SCHEMA`.
    Schema,
    /// `SQLITE_TOOBIG`.
    TooBig,
    /// `SQLITE_CONSTRAINT`.
    Constraint,
    /// `SQLITE_MISMATCH`.
    Mismatch,
    /// `SQLITE_MISUSE`: also used for misuse caught before the native call.
    Misuse,
    /// `SQLITE_NOLFS`.
    NoLfs,
    /// `SQLITE_AUTH`.
    Auth,
    /// `SQLITE_FORMAT`.
    Format,
    /// `SQLITE_RANGE`: also used for out-of-range argument indices.
    Range,
    /// `SQLITE_NOTADB`.
    NotADb,
    /// `SQLITE_NOTICE`.
    Notice,
    /// `SQLITE_WARNING`.
    Warning,
    /// `SQLITE_ROW`.
    Row,
    /// `SQLITE_DONE`.
    Done,
    /// An optional entry point is missing from the loaded engine.
    FeatureUnavailable,
    /// A code this crate does not recognize.
    Unknown(i32),
}

const PRIMARY_CODES: [ErrorCode; 29] = [
    ErrorCode::Ok,
    ErrorCode::Error,
    ErrorCode::Internal,
    ErrorCode::Perm,
    ErrorCode::Abort,
    ErrorCode::Busy,
    ErrorCode::Locked,
    ErrorCode::NoMem,
    ErrorCode::ReadOnly,
    ErrorCode::Interrupt,
    ErrorCode::IoErr,
    ErrorCode::Corrupt,
    ErrorCode::NotFound,
    ErrorCode::Full,
    ErrorCode::CantOpen,
    ErrorCode::Protocol,
    ErrorCode::Empty,
    ErrorCode::Schema,
    ErrorCode::TooBig,
    ErrorCode::Constraint,
    ErrorCode::Mismatch,
    ErrorCode::Misuse,
    ErrorCode::NoLfs,
    ErrorCode::Auth,
    ErrorCode::Format,
    ErrorCode::Range,
    ErrorCode::NotADb,
    ErrorCode::Notice,
    ErrorCode::Warning,
];

impl ErrorCode {
    /// Decode a raw result code; extended codes map by their low byte.
    pub const fn from_code(code: i32) -> ErrorCode {
        match code {
            100 => ErrorCode::Row,
            101 => ErrorCode::Done,
            _ => {
                let primary = code & 0xff;
                if primary >= 0 && (primary as usize) < PRIMARY_CODES.len() {
                    PRIMARY_CODES[primary as usize]
                } else {
                    ErrorCode::Unknown(code)
                }
            }
        }
    }

    /// Numeric engine code, or `None` for crate-only conditions.
    pub fn to_code(self) -> Option<i32> {
        match self {
            ErrorCode::Row => Some(100),
            ErrorCode::Done => Some(101),
            ErrorCode::FeatureUnavailable => None,
            ErrorCode::Unknown(code) => Some(code),
            other => PRIMARY_CODES
                .iter()
                .position(|c| *c == other)
                .map(|idx| idx as i32),
        }
    }

    /// Whether a retry may succeed once another connection lets go.
    pub const fn is_transient(self) -> bool {
        matches!(self, ErrorCode::Busy | ErrorCode::Locked)
    }
}

fn describe(code: &ErrorCode, message: &Option<String>) -> String {
    match (code, message) {
        (_, Some(msg)) => msg.clone(),
        (ErrorCode::Unknown(raw), None) => format!("sqlite error code {raw}"),
        (ErrorCode::FeatureUnavailable, None) => "feature unavailable".to_string(),
        (code, None) => format!("sqlite error {code:?}"),
    }
}

impl Error {
    /// Error with only a primary code.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            extended: None,
            message: None,
        }
    }

    /// Error with a primary code and message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            extended: None,
            message: Some(message.into()),
        }
    }

    /// Error assembled from the fields the engine reports for a failed call.
    pub fn from_code(code: i32, message: Option<String>, extended: Option<i32>) -> Self {
        Self {
            code: ErrorCode::from_code(code),
            extended,
            message,
        }
    }

    /// An optional entry point is not present in the loaded engine.
    pub fn feature_unavailable(msg: &'static str) -> Self {
        Self::with_message(ErrorCode::FeatureUnavailable, msg)
    }

    /// API misuse detected before reaching native code.
    pub fn misuse(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::Misuse, msg)
    }

    /// Index or argument outside its valid range.
    pub fn range(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::Range, msg)
    }

    /// Operation attempted on a connection that is not open.
    pub fn db_closed() -> Self {
        Self::misuse(DB_CLOSED)
    }

    /// Operation attempted on a statement that was already closed.
    pub fn stmt_closed() -> Self {
        Self::misuse(STMT_CLOSED)
    }

    /// Native allocation failure, as opposed to a legitimately absent value.
    pub fn out_of_memory() -> Self {
        Self::with_message(ErrorCode::NoMem, OUT_OF_MEMORY)
    }

    /// Numeric code most specific to this error.
    pub fn raw_code(&self) -> Option<i32> {
        self.extended.or_else(|| self.code.to_code())
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorCode};

    #[test]
    fn error_code_mapping() {
        assert_eq!(ErrorCode::from_code(0), ErrorCode::Ok);
        assert_eq!(ErrorCode::from_code(5), ErrorCode::Busy);
        assert_eq!(ErrorCode::from_code(19), ErrorCode::Constraint);
        // SQLITE_CONSTRAINT_UNIQUE
        assert_eq!(ErrorCode::from_code((8 << 8) | 19), ErrorCode::Constraint);
        assert_eq!(ErrorCode::from_code(28), ErrorCode::Warning);
        assert_eq!(ErrorCode::from_code(101), ErrorCode::Done);
        assert_eq!(ErrorCode::from_code(999), ErrorCode::Unknown(999));
        assert_eq!(ErrorCode::from_code(-1), ErrorCode::Unknown(-1));
    }

    #[test]
    fn code_round_trip_for_primaries() {
        for raw in 0..=28 {
            assert_eq!(ErrorCode::from_code(raw).to_code(), Some(raw));
        }
        assert_eq!(ErrorCode::FeatureUnavailable.to_code(), None);
    }

    #[test]
    fn display_prefers_message() {
        let err = Error::from_code(1, Some("no such table: t".into()), Some(1));
        assert_eq!(err.to_string(), "no such table: t");
        assert_eq!(Error::new(ErrorCode::Busy).to_string(), "sqlite error Busy");
        assert_eq!(
            Error::new(ErrorCode::Unknown(77)).to_string(),
            "sqlite error code 77"
        );
    }

    #[test]
    fn misuse_helpers() {
        let err = Error::db_closed();
        assert_eq!(err.code, ErrorCode::Misuse);
        assert_eq!(err.to_string(), "The database has been closed");
        assert_eq!(Error::stmt_closed().to_string(), "stmt pointer is closed");
        assert_eq!(Error::out_of_memory().code, ErrorCode::NoMem);
        assert!(ErrorCode::Locked.is_transient());
        assert!(!ErrorCode::Error.is_transient());
    }
}
