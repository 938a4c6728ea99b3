use core::ffi::{c_char, c_void};
use core::ptr::NonNull;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::error;

use crate::error::Result;
use crate::marshal::decode_cstr;
use crate::provider::{Sqlite3Api, Sqlite3Hooks};

use super::core::Connection;

/// Decides whether to keep waiting on a locked database.
pub trait BusyHandler: Send + 'static {
    /// `previous_invocations` counts earlier calls for the same lock event.
    /// Return `true` to retry, `false` to give up with `SQLITE_BUSY`.
    fn on_busy(&mut self, previous_invocations: i32) -> bool;
}

impl<F: FnMut(i32) -> bool + Send + 'static> BusyHandler for F {
    fn on_busy(&mut self, previous_invocations: i32) -> bool {
        self(previous_invocations)
    }
}

/// Called periodically during long-running statements.
pub trait ProgressHandler: Send + 'static {
    /// Return `true` to abort the running statement.
    fn on_progress(&mut self) -> bool;
}

impl<F: FnMut() -> bool + Send + 'static> ProgressHandler for F {
    fn on_progress(&mut self) -> bool {
        self()
    }
}

/// Observes transaction outcomes.
pub trait CommitListener: Send + 'static {
    /// `true` after a commit, `false` after a rollback.
    fn on_commit(&mut self, committed: bool);
}

impl<F: FnMut(bool) + Send + 'static> CommitListener for F {
    fn on_commit(&mut self, committed: bool) {
        self(committed)
    }
}

/// Kind of row change reported to an [`UpdateListener`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    /// `SQLITE_INSERT`.
    Insert,
    /// `SQLITE_DELETE`.
    Delete,
    /// `SQLITE_UPDATE`.
    Update,
}

impl UpdateKind {
    /// Decode the engine's operation code.
    pub const fn from_code(code: i32) -> Option<UpdateKind> {
        match code {
            18 => Some(UpdateKind::Insert),
            9 => Some(UpdateKind::Delete),
            23 => Some(UpdateKind::Update),
            _ => None,
        }
    }

    /// Engine operation code.
    pub const fn code(self) -> i32 {
        match self {
            UpdateKind::Insert => 18,
            UpdateKind::Delete => 9,
            UpdateKind::Update => 23,
        }
    }
}

/// Observes row changes on rowid tables.
pub trait UpdateListener: Send + 'static {
    /// Called after a row is inserted, deleted or updated.
    fn on_update(&mut self, kind: UpdateKind, db_name: &str, table: &str, rowid: i64);
}

impl<F> UpdateListener for F
where
    F: FnMut(UpdateKind, &str, &str, i64) + Send + 'static,
{
    fn on_update(&mut self, kind: UpdateKind, db_name: &str, table: &str, rowid: i64) {
        self(kind, db_name, table, rowid)
    }
}

type BusyState = Box<dyn BusyHandler>;
type ProgressState = Box<dyn ProgressHandler>;
type CommitState = Box<dyn CommitListener>;
type UpdateState = Box<dyn UpdateListener>;

extern "C" fn busy_trampoline(ctx: *mut c_void, previous_invocations: i32) -> i32 {
    if ctx.is_null() {
        return 0;
    }
    let handler = unsafe { &mut *(ctx as *mut BusyState) };
    match catch_unwind(AssertUnwindSafe(|| handler.on_busy(previous_invocations))) {
        Ok(retry) => i32::from(retry),
        Err(_) => {
            error!("busy handler panicked");
            0
        }
    }
}

extern "C" fn progress_trampoline(ctx: *mut c_void) -> i32 {
    if ctx.is_null() {
        return 0;
    }
    let handler = unsafe { &mut *(ctx as *mut ProgressState) };
    // Abort the statement if the handler panics.
    match catch_unwind(AssertUnwindSafe(|| handler.on_progress())) {
        Ok(abort) => i32::from(abort),
        Err(_) => {
            error!("progress handler panicked");
            1
        }
    }
}

fn notify_commit(ctx: *mut c_void, committed: bool) {
    if ctx.is_null() {
        return;
    }
    let listener = unsafe { &mut *(ctx as *mut CommitState) };
    if catch_unwind(AssertUnwindSafe(|| listener.on_commit(committed))).is_err() {
        error!(committed, "commit listener panicked");
    }
}

extern "C" fn commit_trampoline(ctx: *mut c_void) -> i32 {
    notify_commit(ctx, true);
    // Never veto the commit.
    0
}

extern "C" fn rollback_trampoline(ctx: *mut c_void) {
    notify_commit(ctx, false);
}

extern "C" fn update_trampoline(
    ctx: *mut c_void,
    op: i32,
    db_name: *const c_char,
    table: *const c_char,
    rowid: i64,
) {
    if ctx.is_null() {
        return;
    }
    let Some(kind) = UpdateKind::from_code(op) else {
        return;
    };
    // Copy both names before dispatch; the pointers die with this call.
    let db_name = unsafe { decode_cstr(db_name) }.unwrap_or_default();
    let table = unsafe { decode_cstr(table) }.unwrap_or_default();
    let listener = unsafe { &mut *(ctx as *mut UpdateState) };
    if catch_unwind(AssertUnwindSafe(|| {
        listener.on_update(kind, &db_name, &table, rowid)
    }))
    .is_err()
    {
        error!(table = %table, rowid, "update listener panicked");
    }
}

unsafe fn drop_state<T>(ctx: *mut c_void) {
    unsafe { drop(Box::from_raw(ctx as *mut T)) };
}

type ClearFn<P> = unsafe fn(&P, NonNull<<P as Sqlite3Api>::Db>) -> Result<()>;

unsafe fn clear_progress<P: Sqlite3Hooks>(api: &P, db: NonNull<P::Db>) -> Result<()> {
    unsafe { api.progress_handler(db, 0, None, core::ptr::null_mut()) }
}

unsafe fn clear_busy<P: Sqlite3Hooks>(api: &P, db: NonNull<P::Db>) -> Result<()> {
    unsafe { api.busy_handler(db, None, core::ptr::null_mut()) }
}

unsafe fn clear_commit<P: Sqlite3Hooks>(api: &P, db: NonNull<P::Db>) -> Result<()> {
    let commit = unsafe { api.commit_hook(db, None, core::ptr::null_mut()) };
    let rollback = unsafe { api.rollback_hook(db, None, core::ptr::null_mut()) };
    commit.and(rollback)
}

unsafe fn clear_update<P: Sqlite3Hooks>(api: &P, db: NonNull<P::Db>) -> Result<()> {
    unsafe { api.update_hook(db, None, core::ptr::null_mut()) }
}

/// Heap state the engine holds a context pointer to.
///
/// Freed on drop, so a slot may only be dropped once the engine no longer
/// references `ctx`.
pub(crate) struct HookSlot<P: Sqlite3Api> {
    ctx: *mut c_void,
    drop_ctx: unsafe fn(*mut c_void),
    clear: ClearFn<P>,
}

impl<P: Sqlite3Api> HookSlot<P> {
    fn new<T>(state: T, clear: ClearFn<P>) -> Self {
        Self {
            ctx: Box::into_raw(Box::new(state)) as *mut c_void,
            drop_ctx: drop_state::<T>,
            clear,
        }
    }
}

impl<P: Sqlite3Api> Drop for HookSlot<P> {
    fn drop(&mut self) {
        unsafe { (self.drop_ctx)(self.ctx) };
    }
}

#[derive(Clone, Copy, Debug)]
enum HookKind {
    Progress,
    Busy,
    Commit,
    Update,
}

/// Registered hook state, one slot per hook kind.
pub(crate) struct HookSlots<P: Sqlite3Api> {
    progress: Option<HookSlot<P>>,
    busy: Option<HookSlot<P>>,
    commit: Option<HookSlot<P>>,
    update: Option<HookSlot<P>>,
}

impl<P: Sqlite3Api> HookSlots<P> {
    pub(crate) fn new() -> Self {
        Self {
            progress: None,
            busy: None,
            commit: None,
            update: None,
        }
    }

    fn slot_mut(&mut self, kind: HookKind) -> &mut Option<HookSlot<P>> {
        match kind {
            HookKind::Progress => &mut self.progress,
            HookKind::Busy => &mut self.busy,
            HookKind::Commit => &mut self.commit,
            HookKind::Update => &mut self.update,
        }
    }

    /// Unregister and free every slot: progress, busy, commit and rollback,
    /// then update. Stops at the first native failure, leaving the rest
    /// registered.
    pub(crate) fn clear_all(&mut self, api: &P, db: NonNull<P::Db>) -> Result<()> {
        for slot in [
            &mut self.progress,
            &mut self.busy,
            &mut self.commit,
            &mut self.update,
        ] {
            if let Some(hook) = slot.as_ref() {
                unsafe { (hook.clear)(api, db)? };
                *slot = None;
            }
        }
        Ok(())
    }
}

impl<'p, P: Sqlite3Hooks> Connection<'p, P> {
    /// Install `state` natively, then retire the previous slot of the same
    /// kind. The old state is freed only after the replacement is in place.
    fn install_hook<T>(
        &self,
        kind: HookKind,
        state: T,
        clear: ClearFn<P>,
        install: impl FnOnce(NonNull<P::Db>, *mut c_void) -> Result<()>,
    ) -> Result<()> {
        let mut guard = self.lock();
        let db = guard.db()?;
        let slot = HookSlot::new(state, clear);
        // On failure the engine never saw the new context; dropping frees it.
        install(db, slot.ctx)?;
        let previous = guard.hooks.slot_mut(kind).replace(slot);
        drop(previous);
        Ok(())
    }

    fn remove_hook(&self, kind: HookKind, clear: ClearFn<P>) -> Result<()> {
        let mut guard = self.lock();
        let db = guard.db()?;
        unsafe { clear(self.api, db)? };
        guard.hooks.slot_mut(kind).take();
        Ok(())
    }

    /// Sleep-and-retry on locked tables for up to `ms` milliseconds.
    /// Replaces any busy handler.
    pub fn busy_timeout(&self, ms: i32) -> Result<()> {
        let mut guard = self.lock();
        let db = guard.db()?;
        unsafe { self.api.busy_timeout(db, ms)? };
        // The engine swapped in its own handler; ours is unreachable now.
        guard.hooks.slot_mut(HookKind::Busy).take();
        Ok(())
    }

    /// Install a busy handler, replacing any previous one.
    pub fn set_busy_handler(&self, handler: impl BusyHandler) -> Result<()> {
        let state: BusyState = Box::new(handler);
        self.install_hook(HookKind::Busy, state, clear_busy::<P>, |db, ctx| unsafe {
            self.api.busy_handler(db, Some(busy_trampoline), ctx)
        })
    }

    /// Remove the busy handler.
    pub fn clear_busy_handler(&self) -> Result<()> {
        self.remove_hook(HookKind::Busy, clear_busy::<P>)
    }

    /// Call `handler` about every `n_ops` virtual machine instructions.
    pub fn set_progress_handler(&self, n_ops: i32, handler: impl ProgressHandler) -> Result<()> {
        let state: ProgressState = Box::new(handler);
        self.install_hook(
            HookKind::Progress,
            state,
            clear_progress::<P>,
            |db, ctx| unsafe {
                self.api
                    .progress_handler(db, n_ops, Some(progress_trampoline), ctx)
            },
        )
    }

    /// Remove the progress handler.
    pub fn clear_progress_handler(&self) -> Result<()> {
        self.remove_hook(HookKind::Progress, clear_progress::<P>)
    }

    /// Observe commits and rollbacks through one listener.
    pub fn set_commit_listener(&self, listener: impl CommitListener) -> Result<()> {
        let state: CommitState = Box::new(listener);
        self.install_hook(HookKind::Commit, state, clear_commit::<P>, |db, ctx| {
            unsafe { self.api.commit_hook(db, Some(commit_trampoline), ctx)? };
            if let Err(err) = unsafe { self.api.rollback_hook(db, Some(rollback_trampoline), ctx) } {
                // Keep the engine from holding the context we are about to free.
                if let Err(undo) = unsafe { self.api.commit_hook(db, None, core::ptr::null_mut()) } {
                    error!(error = %undo, "failed to unwind commit hook");
                }
                return Err(err);
            }
            Ok(())
        })
    }

    /// Remove the commit and rollback hooks.
    pub fn clear_commit_listener(&self) -> Result<()> {
        self.remove_hook(HookKind::Commit, clear_commit::<P>)
    }

    /// Observe inserts, updates and deletes.
    pub fn set_update_listener(&self, listener: impl UpdateListener) -> Result<()> {
        let state: UpdateState = Box::new(listener);
        self.install_hook(HookKind::Update, state, clear_update::<P>, |db, ctx| unsafe {
            self.api.update_hook(db, Some(update_trampoline), ctx)
        })
    }

    /// Remove the update hook.
    pub fn clear_update_listener(&self) -> Result<()> {
        self.remove_hook(HookKind::Update, clear_update::<P>)
    }
}

#[cfg(test)]
mod tests {
    use core::ffi::c_void;
    use std::sync::{Arc, Mutex};

    use super::{
        BusyState, CommitListener, CommitState, ProgressState, UpdateKind, UpdateState, busy_trampoline,
        commit_trampoline, progress_trampoline, rollback_trampoline, update_trampoline,
    };

    struct PanickingListener;

    impl CommitListener for PanickingListener {
        fn on_commit(&mut self, _committed: bool) {
            panic!("commit");
        }
    }

    fn ctx_of<T>(state: &mut T) -> *mut c_void {
        state as *mut T as *mut c_void
    }

    #[test]
    fn update_kind_codes() {
        for kind in [UpdateKind::Insert, UpdateKind::Delete, UpdateKind::Update] {
            assert_eq!(UpdateKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(UpdateKind::from_code(19), None);
    }

    #[test]
    fn null_context_is_inert() {
        assert_eq!(busy_trampoline(core::ptr::null_mut(), 3), 0);
        assert_eq!(progress_trampoline(core::ptr::null_mut()), 0);
        assert_eq!(commit_trampoline(core::ptr::null_mut()), 0);
    }

    #[test]
    fn busy_handler_sees_attempt_count() {
        let mut state: BusyState = Box::new(|attempts: i32| attempts < 2);
        let ctx = ctx_of(&mut state);
        assert_eq!(busy_trampoline(ctx, 0), 1);
        assert_eq!(busy_trampoline(ctx, 1), 1);
        assert_eq!(busy_trampoline(ctx, 2), 0);
    }

    #[test]
    fn panics_stay_on_this_side() {
        let mut busy: BusyState = Box::new(|_: i32| -> bool { panic!("busy") });
        assert_eq!(busy_trampoline(ctx_of(&mut busy), 0), 0);

        let mut progress: ProgressState = Box::new(|| -> bool { panic!("progress") });
        assert_eq!(progress_trampoline(ctx_of(&mut progress)), 1);

        let mut commit: CommitState = Box::new(PanickingListener);
        assert_eq!(commit_trampoline(ctx_of(&mut commit)), 0);
        rollback_trampoline(ctx_of(&mut commit));
    }

    #[test]
    fn commit_and_rollback_share_listener() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut state: CommitState = Box::new(move |committed: bool| {
            sink.lock().unwrap().push(committed);
        });
        let ctx = ctx_of(&mut state);
        assert_eq!(commit_trampoline(ctx), 0);
        rollback_trampoline(ctx);
        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn update_names_are_decoded() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut state: UpdateState = Box::new(
            move |kind: UpdateKind, db: &str, table: &str, rowid: i64| {
                sink.lock()
                    .unwrap()
                    .push((kind, db.to_owned(), table.to_owned(), rowid));
            },
        );
        let ctx = ctx_of(&mut state);
        update_trampoline(ctx, 18, c"main".as_ptr(), c"users".as_ptr(), 7);
        update_trampoline(ctx, 99, c"main".as_ptr(), c"users".as_ptr(), 8);
        update_trampoline(ctx, 9, core::ptr::null(), c"users".as_ptr(), 9);
        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (UpdateKind::Insert, "main".to_owned(), "users".to_owned(), 7),
                (UpdateKind::Delete, String::new(), "users".to_owned(), 9),
            ]
        );
    }
}
