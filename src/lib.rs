//! Native interop and resource-safety layer over the SQLite3 C API.
//!
//! The core is backend-agnostic: every native call goes through the
//! [`Sqlite3Api`] provider SPI and its optional extension traits, so the
//! lifecycle, statement, callback, and backup logic here never links the
//! engine directly.

mod connection;
mod error;
mod function;
pub mod marshal;
mod provider;
mod statement;
mod value;

pub use crate::connection::{
    BackupConfig, BackupObserver, BackupStatus, BusyHandler, ColumnConstraints, CommitListener,
    Connection, Limit, MAX_DESERIALIZE_SIZE, ProgressHandler, UpdateKind, UpdateListener,
};
pub use crate::error::{Error, ErrorCode, Result};
pub use crate::function::{
    AggregateFunction, Args, Collation, Context, Function, ScalarFunction, WindowFunction,
};
pub use crate::provider::{
    ApiVersion, BackupStep, BusyCallback, ColumnMetadata, CommitCallback, CompareCallback,
    DeserializeFlags, DestroyCallback, FeatureSet, FunctionFlags, OpenFlags, OpenOptions,
    OwnedBytes, ProgressCallback, RawBytes, RollbackCallback, Sqlite3Api, Sqlite3Backup,
    Sqlite3Hooks, Sqlite3Metadata, Sqlite3Serialize, StepResult, UpdateCallback, ValueType,
};
pub use crate::statement::Statement;
pub use crate::value::{Value, ValueRef};
