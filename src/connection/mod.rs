mod backup;
mod core;
mod hooks;
mod limits;
mod serialize;

pub use self::backup::{BackupConfig, BackupObserver, BackupStatus};
pub use self::core::{ColumnConstraints, Connection};
pub use self::hooks::{BusyHandler, CommitListener, ProgressHandler, UpdateKind, UpdateListener};
pub use self::limits::Limit;
pub use self::serialize::MAX_DESERIALIZE_SIZE;
