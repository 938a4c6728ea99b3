use core::ffi::CStr;
use core::ptr::NonNull;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::provider::{
    ApiVersion, BackupStep, FeatureSet, OpenFlags, OpenOptions, Sqlite3Api, Sqlite3Backup,
};

use super::core::Connection;

const MIN_BACKUP_VERSION: ApiVersion = ApiVersion::new(3, 6, 11);

/// Tuning for [`Connection::backup`] and [`Connection::restore`].
///
/// A copy holds the connection lock from start to finish, including the
/// pauses between busy retries. Other callers on the same connection can
/// therefore wait up to [`BackupConfig::max_busy_wait`] on top of the time
/// spent copying pages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupConfig {
    /// Pages copied per step.
    pub pages_per_step: i32,
    /// Pause after a busy or locked step.
    pub busy_sleep: Duration,
    /// Busy or locked steps tolerated before giving up.
    pub max_busy_retries: u32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            pages_per_step: 100,
            busy_sleep: Duration::from_millis(100),
            max_busy_retries: 3,
        }
    }
}

impl BackupConfig {
    /// Set pages copied per step; negative copies everything at once.
    pub fn with_pages_per_step(mut self, pages: i32) -> Self {
        self.pages_per_step = pages;
        self
    }

    /// Set the pause after a busy step.
    pub fn with_busy_sleep(mut self, sleep: Duration) -> Self {
        self.busy_sleep = sleep;
        self
    }

    /// Set the retry ceiling.
    pub fn with_max_busy_retries(mut self, retries: u32) -> Self {
        self.max_busy_retries = retries;
        self
    }

    /// Longest total pause a copy spends sleeping on busy steps.
    pub fn max_busy_wait(&self) -> Duration {
        self.busy_sleep.saturating_mul(self.max_busy_retries)
    }
}

/// How a copy ended when it did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupStatus {
    /// Every page was copied.
    Done,
    /// The retry ceiling was reached while the database stayed busy.
    TimedOut,
}

/// Receives page counts after each successful step.
pub trait BackupObserver {
    /// `remaining` of `page_count` pages are still to be copied.
    fn progress(&mut self, remaining: i32, page_count: i32);
}

impl<F: FnMut(i32, i32)> BackupObserver for F {
    fn progress(&mut self, remaining: i32, page_count: i32) {
        self(remaining, page_count)
    }
}

#[derive(Debug)]
enum CopyOutcome {
    Done,
    TimedOut,
    Failed(Error),
}

fn run_steps(
    config: &BackupConfig,
    mut step: impl FnMut() -> Result<BackupStep>,
    mut on_progress: impl FnMut(),
) -> CopyOutcome {
    let mut retries = 0;
    loop {
        match step() {
            Ok(status) => {
                on_progress();
                if status == BackupStep::Done {
                    return CopyOutcome::Done;
                }
            }
            Err(err) if err.code.is_transient() => {
                if retries >= config.max_busy_retries {
                    warn!(retries, "database stayed busy, giving up");
                    return CopyOutcome::TimedOut;
                }
                retries += 1;
                std::thread::sleep(config.busy_sleep);
            }
            Err(err) => return CopyOutcome::Failed(err),
        }
    }
}

/// Handle opened for a single copy; closed on every exit path.
struct ScratchDb<'p, P: Sqlite3Api> {
    api: &'p P,
    db: NonNull<P::Db>,
}

impl<'p, P: Sqlite3Api> ScratchDb<'p, P> {
    fn open(api: &'p P, path: &str, flags: OpenFlags) -> Result<Self> {
        let db = unsafe { api.open(path, OpenOptions::new(flags.with_uri_for(path)))? };
        Ok(Self { api, db })
    }

    fn last_error(&self) -> Option<Error> {
        let code = unsafe { self.api.errcode(self.db) };
        if code == 0 {
            return None;
        }
        let msg = unsafe { self.api.errmsg(self.db) };
        let message = (!msg.is_null())
            .then(|| unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned());
        let extended = unsafe { self.api.extended_errcode(self.db) };
        Some(Error::from_code(code, message, extended))
    }
}

impl<P: Sqlite3Api> Drop for ScratchDb<'_, P> {
    fn drop(&mut self) {
        if let Err(err) = unsafe { self.api.close(self.db) } {
            warn!(error = %err, "failed to close backup file handle");
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Direction {
    Backup,
    Restore,
}

impl<'p, P: Sqlite3Backup> Connection<'p, P> {
    /// Copy database `db_name` of this connection into the file at `dest_path`.
    pub fn backup(
        &self,
        db_name: &str,
        dest_path: &str,
        observer: Option<&mut dyn BackupObserver>,
        config: &BackupConfig,
    ) -> Result<BackupStatus> {
        self.copy_database(Direction::Backup, db_name, dest_path, observer, config)
    }

    /// Replace database `db_name` of this connection with the file at
    /// `source_path`.
    pub fn restore(
        &self,
        db_name: &str,
        source_path: &str,
        observer: Option<&mut dyn BackupObserver>,
        config: &BackupConfig,
    ) -> Result<BackupStatus> {
        self.copy_database(Direction::Restore, db_name, source_path, observer, config)
    }

    fn copy_database(
        &self,
        direction: Direction,
        db_name: &str,
        path: &str,
        mut observer: Option<&mut dyn BackupObserver>,
        config: &BackupConfig,
    ) -> Result<BackupStatus> {
        let version = self
            .api
            .backend_version()
            .unwrap_or_else(|| self.api.api_version());
        if version < MIN_BACKUP_VERSION {
            return Err(Error::with_message(
                ErrorCode::Internal,
                "online backup needs SQLite 3.6.11 or later",
            ));
        }
        if !self.api.feature_set().contains(FeatureSet::BACKUP) {
            return Err(Error::feature_unavailable("backup API not available"));
        }
        self.with_db(|db| {
            debug!(?direction, db_name, path, "starting copy");
            let scratch = match direction {
                Direction::Backup => ScratchDb::open(self.api, path, OpenFlags::read_write_create())?,
                Direction::Restore => ScratchDb::open(self.api, path, OpenFlags::READ_ONLY)?,
            };
            let backup = unsafe {
                match direction {
                    Direction::Backup => self.api.backup_init(scratch.db, "main", db, db_name)?,
                    Direction::Restore => self.api.backup_init(db, db_name, scratch.db, "main")?,
                }
            };
            let outcome = run_steps(
                config,
                || unsafe { self.api.backup_step(backup, config.pages_per_step) },
                || {
                    if let Some(observer) = observer.as_deref_mut() {
                        let remaining = unsafe { self.api.backup_remaining(backup) };
                        let page_count = unsafe { self.api.backup_pagecount(backup) };
                        observer.progress(remaining, page_count);
                    }
                },
            );
            let finished = unsafe { self.api.backup_finish(backup) };
            debug!(?direction, ?outcome, "copy finished");
            match outcome {
                CopyOutcome::TimedOut => Ok(BackupStatus::TimedOut),
                CopyOutcome::Failed(err) if err.message.is_some() => Err(err),
                CopyOutcome::Failed(err) => Err(scratch.last_error().unwrap_or(err)),
                CopyOutcome::Done => {
                    finished?;
                    match scratch.last_error() {
                        Some(err) => Err(err),
                        None => Ok(BackupStatus::Done),
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{BackupConfig, CopyOutcome, run_steps};
    use crate::error::{Error, ErrorCode};
    use crate::provider::BackupStep;

    fn config(retries: u32) -> BackupConfig {
        BackupConfig::default()
            .with_busy_sleep(Duration::ZERO)
            .with_max_busy_retries(retries)
    }

    fn busy_then_done(busy_steps: usize) -> impl FnMut() -> crate::Result<BackupStep> {
        let mut calls = 0;
        move || {
            calls += 1;
            if calls <= busy_steps {
                Err(Error::new(ErrorCode::Busy))
            } else {
                Ok(BackupStep::Done)
            }
        }
    }

    #[test]
    fn defaults() {
        let config = BackupConfig::default();
        assert_eq!(config.pages_per_step, 100);
        assert_eq!(config.busy_sleep, Duration::from_millis(100));
        assert_eq!(config.max_busy_retries, 3);
    }

    #[test]
    fn busy_wait_is_bounded_by_retries() {
        let config = BackupConfig::default();
        assert_eq!(config.max_busy_wait(), Duration::from_millis(300));
        let config = config
            .with_busy_sleep(Duration::from_millis(20))
            .with_max_busy_retries(0);
        assert_eq!(config.max_busy_wait(), Duration::ZERO);
    }

    #[test]
    fn retry_ceiling_below_busy_run_times_out() {
        let outcome = run_steps(&config(3), busy_then_done(4), || {});
        assert!(matches!(outcome, CopyOutcome::TimedOut));
    }

    #[test]
    fn retry_ceiling_covering_busy_run_completes() {
        for ceiling in [4, 5, 10] {
            let mut progress = 0;
            let outcome = run_steps(&config(ceiling), busy_then_done(4), || progress += 1);
            assert!(matches!(outcome, CopyOutcome::Done));
            assert_eq!(progress, 1);
        }
    }

    #[test]
    fn locked_counts_as_busy() {
        let mut calls = 0;
        let outcome = run_steps(
            &config(0),
            || {
                calls += 1;
                Err(Error::new(ErrorCode::Locked))
            },
            || {},
        );
        assert!(matches!(outcome, CopyOutcome::TimedOut));
        assert_eq!(calls, 1);
    }

    #[test]
    fn other_errors_stop_immediately() {
        let mut calls = 0;
        let outcome = run_steps(
            &config(10),
            || {
                calls += 1;
                if calls == 1 {
                    Ok(BackupStep::More)
                } else {
                    Err(Error::new(ErrorCode::IoErr))
                }
            },
            || {},
        );
        match outcome {
            CopyOutcome::Failed(err) => assert_eq!(err.code, ErrorCode::IoErr),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(calls, 2);
    }
}
