use core::cmp::Ordering;
use core::ffi::c_void;
use core::ptr::NonNull;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::error;

use crate::connection::Connection;
use crate::error::{Error, OUT_OF_MEMORY, Result};
use crate::marshal::{decode_blob, validate_name};
use crate::provider::{DestroyCallback, FeatureSet, FunctionFlags, RawBytes, Sqlite3Api, ValueType};
use crate::value::{Value, ValueRef};

/// Result setter for the function invocation in progress.
pub struct Context<'a, P: Sqlite3Api> {
    api: &'a P,
    ctx: NonNull<P::Context>,
}

impl<'a, P: Sqlite3Api> Context<'a, P> {
    pub(crate) fn new(api: &'a P, ctx: NonNull<P::Context>) -> Self {
        Self { api, ctx }
    }

    /// Set NULL result.
    pub fn result_null(&self) {
        unsafe { self.api.result_null(self.ctx) }
    }

    /// Set a 32-bit integer result.
    pub fn result_int(&self, v: i32) {
        self.result_int64(v.into())
    }

    /// Set integer result.
    pub fn result_int64(&self, v: i64) {
        unsafe { self.api.result_int64(self.ctx, v) }
    }

    /// Set floating result.
    pub fn result_double(&self, v: f64) {
        unsafe { self.api.result_double(self.ctx, v) }
    }

    /// Set text result; the engine copies it.
    pub fn result_text(&self, v: &str) {
        unsafe { self.api.result_text(self.ctx, v) }
    }

    /// Set blob result; the engine copies it.
    pub fn result_blob(&self, v: &[u8]) {
        unsafe { self.api.result_blob(self.ctx, v) }
    }

    /// Fail the invocation with `msg`.
    pub fn result_error(&self, msg: &str) {
        unsafe { self.api.result_error(self.ctx, msg) }
    }

    /// Set result from an owned `Value`.
    pub fn result_value(&self, value: Value) {
        match value {
            Value::Null => self.result_null(),
            Value::Integer(v) => self.result_int64(v),
            Value::Float(v) => self.result_double(v),
            Value::Text(v) => self.result_text(&v),
            Value::Blob(v) => self.result_blob(&v),
        }
    }
}

/// Arguments of the function invocation in progress.
///
/// Valid only while the callback runs. Indices are checked before any native
/// accessor is called.
pub struct Args<'a, P: Sqlite3Api> {
    api: &'a P,
    argv: *mut *mut P::Value,
    argc: i32,
}

impl<'a, P: Sqlite3Api> Args<'a, P> {
    pub(crate) fn new(api: &'a P, argc: i32, argv: *mut *mut P::Value) -> Self {
        Self { api, argv, argc }
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.argc.max(0) as usize
    }

    /// Whether the function was called without arguments.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn value(&self, arg: i32) -> Result<NonNull<P::Value>> {
        if arg < 0 {
            return Err(Error::range("negative arg out of range"));
        }
        if self.argv.is_null() {
            return Err(Error::misuse("no current value"));
        }
        if arg >= self.argc {
            return Err(Error::range("arg out of range"));
        }
        let raw = unsafe { *self.argv.add(arg as usize) };
        NonNull::new(raw).ok_or_else(|| Error::misuse("no current value"))
    }

    /// Storage class of argument `arg`.
    pub fn value_type(&self, arg: i32) -> Result<ValueType> {
        let value = self.value(arg)?;
        Ok(unsafe { self.api.value_type(value) })
    }

    /// Argument as a 32-bit integer.
    pub fn int(&self, arg: i32) -> Result<i32> {
        let value = self.value(arg)?;
        Ok(unsafe { self.api.value_int(value) })
    }

    /// Argument as a 64-bit integer.
    pub fn int64(&self, arg: i32) -> Result<i64> {
        let value = self.value(arg)?;
        Ok(unsafe { self.api.value_int64(value) })
    }

    /// Argument as a double.
    pub fn double(&self, arg: i32) -> Result<f64> {
        let value = self.value(arg)?;
        Ok(unsafe { self.api.value_double(value) })
    }

    /// Argument as text; `None` for SQL NULL.
    pub fn text(&self, arg: i32) -> Result<Option<String>> {
        let value = self.value(arg)?;
        if unsafe { self.api.value_type(value) } == ValueType::Null {
            return Ok(None);
        }
        let raw = unsafe { self.api.value_text(value) };
        if raw.is_null() {
            return Err(Error::out_of_memory());
        }
        let bytes = unsafe { raw.as_slice() };
        Ok(Some(String::from_utf8_lossy(bytes).into_owned()))
    }

    /// Argument as bytes; `None` for SQL NULL.
    pub fn blob(&self, arg: i32) -> Result<Option<Vec<u8>>> {
        let value = self.value(arg)?;
        let ty = unsafe { self.api.value_type(value) };
        let raw = unsafe { self.api.value_blob(value) };
        unsafe { decode_blob(raw, ty, || 0) }
    }

    /// Borrowed view of argument `arg` for the rest of this invocation.
    pub fn get(&self, arg: i32) -> Result<ValueRef<'a>> {
        let value = self.value(arg)?;
        let api = self.api;
        Ok(match unsafe { api.value_type(value) } {
            ValueType::Null => ValueRef::Null,
            ValueType::Integer => ValueRef::Integer(unsafe { api.value_int64(value) }),
            ValueType::Float => ValueRef::Float(unsafe { api.value_double(value) }),
            ValueType::Text => unsafe { ValueRef::from_raw_text(api.value_text(value)) },
            ValueType::Blob => unsafe { ValueRef::from_raw_blob(api.value_blob(value)) },
        })
    }

    /// Every argument, copied out.
    pub fn to_values(&self) -> Result<Vec<Value>> {
        (0..self.argc).map(|arg| Ok(self.get(arg)?.to_owned())).collect()
    }
}

/// Scalar SQL function.
pub trait ScalarFunction<P: Sqlite3Api>: Send + 'static {
    /// Compute the result for one row.
    fn call(&mut self, ctx: &Context<'_, P>, args: &Args<'_, P>) -> Result<Value>;
}

impl<P, F> ScalarFunction<P> for F
where
    P: Sqlite3Api,
    F: FnMut(&Context<'_, P>, &Args<'_, P>) -> Result<Value> + Send + 'static,
{
    fn call(&mut self, ctx: &Context<'_, P>, args: &Args<'_, P>) -> Result<Value> {
        self(ctx, args)
    }
}

/// Per-group state of an aggregate SQL function.
pub trait AggregateFunction<P: Sqlite3Api>: Send + 'static {
    /// Fold one row into the group.
    fn step(&mut self, ctx: &Context<'_, P>, args: &Args<'_, P>) -> Result<()>;
    /// Produce the group's result. Called once, also for empty groups.
    fn finalize(&mut self, ctx: &Context<'_, P>) -> Result<Value>;
}

/// Aggregate that can also run over a sliding window frame.
pub trait WindowFunction<P: Sqlite3Api>: AggregateFunction<P> {
    /// Remove one row that left the frame.
    fn inverse(&mut self, ctx: &Context<'_, P>, args: &Args<'_, P>) -> Result<()>;
    /// Current result without ending the group.
    fn value(&mut self, ctx: &Context<'_, P>) -> Result<Value>;
}

type AggregateFactory<P> = Box<dyn Fn() -> Box<dyn AggregateFunction<P>> + Send + Sync>;
type WindowFactory<P> = Box<dyn Fn() -> Box<dyn WindowFunction<P>> + Send + Sync>;

/// User routine, tagged by how the engine drives it.
pub enum Function<P: Sqlite3Api> {
    /// One call per row.
    Scalar(Box<dyn ScalarFunction<P>>),
    /// Fresh state per group from the factory.
    Aggregate(AggregateFactory<P>),
    /// Fresh window state per partition from the factory.
    Window(WindowFactory<P>),
}

impl<P: Sqlite3Api> Function<P> {
    /// Scalar function from a closure.
    pub fn scalar<F>(f: F) -> Self
    where
        F: FnMut(&Context<'_, P>, &Args<'_, P>) -> Result<Value> + Send + 'static,
    {
        Function::Scalar(Box::new(f))
    }

    /// Aggregate whose per-group state comes from `factory`.
    pub fn aggregate<A, F>(factory: F) -> Self
    where
        A: AggregateFunction<P>,
        F: Fn() -> A + Send + Sync + 'static,
    {
        Function::Aggregate(Box::new(move || Box::new(factory()) as Box<dyn AggregateFunction<P>>))
    }

    /// Window function whose per-partition state comes from `factory`.
    pub fn window<W, F>(factory: F) -> Self
    where
        W: WindowFunction<P>,
        F: Fn() -> W + Send + Sync + 'static,
    {
        Function::Window(Box::new(move || Box::new(factory()) as Box<dyn WindowFunction<P>>))
    }
}

enum Accumulator<P: Sqlite3Api> {
    Aggregate(Box<dyn AggregateFunction<P>>),
    Window(Box<dyn WindowFunction<P>>),
}

impl<P: Sqlite3Api> Accumulator<P> {
    fn step(&mut self, ctx: &Context<'_, P>, args: &Args<'_, P>) -> Result<()> {
        match self {
            Accumulator::Aggregate(acc) => acc.step(ctx, args),
            Accumulator::Window(acc) => acc.step(ctx, args),
        }
    }

    fn inverse(&mut self, ctx: &Context<'_, P>, args: &Args<'_, P>) -> Result<()> {
        match self {
            Accumulator::Aggregate(_) => Err(Error::misuse("inverse on a plain aggregate")),
            Accumulator::Window(acc) => acc.inverse(ctx, args),
        }
    }

    fn value(&mut self, ctx: &Context<'_, P>) -> Result<Value> {
        match self {
            Accumulator::Aggregate(_) => Err(Error::misuse("value on a plain aggregate")),
            Accumulator::Window(acc) => acc.value(ctx),
        }
    }

    fn finalize(&mut self, ctx: &Context<'_, P>) -> Result<Value> {
        match self {
            Accumulator::Aggregate(acc) => acc.finalize(ctx),
            Accumulator::Window(acc) => acc.finalize(ctx),
        }
    }
}

/// `user_data` of a registered function; freed by the engine's destroy call.
struct Routine<P: Sqlite3Api> {
    api: *const P,
    name: String,
    function: Function<P>,
}

impl<P: Sqlite3Api> Routine<P> {
    fn accumulator(&self) -> Result<Accumulator<P>> {
        match &self.function {
            Function::Aggregate(factory) => Ok(Accumulator::Aggregate(factory())),
            Function::Window(factory) => Ok(Accumulator::Window(factory())),
            Function::Scalar(_) => Err(Error::misuse("scalar function has no group state")),
        }
    }
}

unsafe fn routine<'a, P: Sqlite3Api>(ctx: NonNull<P::Context>) -> Option<&'a mut Routine<P>> {
    let user_data = unsafe { P::user_data(ctx) };
    if user_data.is_null() {
        return None;
    }
    Some(unsafe { &mut *(user_data as *mut Routine<P>) })
}

// The aggregate context holds one pointer; the accumulator lives in a Box so
// its alignment does not depend on the engine allocation.
type AccumulatorSlot<P> = *mut Accumulator<P>;

unsafe fn accumulator_slot<P: Sqlite3Api>(
    api: &P,
    ctx: NonNull<P::Context>,
    allocate: bool,
) -> *mut AccumulatorSlot<P> {
    let bytes = if allocate {
        core::mem::size_of::<AccumulatorSlot<P>>()
    } else {
        0
    };
    unsafe { api.aggregate_context(ctx, bytes) as *mut AccumulatorSlot<P> }
}

/// Turn a callback outcome into a value, or report it to the engine.
fn settle<P: Sqlite3Api, T>(
    context: &Context<'_, P>,
    name: &str,
    out: std::thread::Result<Result<T>>,
) -> Option<T> {
    match out {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            context.result_error(&err.to_string());
            None
        }
        Err(_) => {
            error!(function = name, "user function panicked");
            context.result_error(&format!("panic in user function '{name}'"));
            None
        }
    }
}

extern "C" fn scalar_trampoline<P: Sqlite3Api>(
    ctx: *mut P::Context,
    argc: i32,
    argv: *mut *mut P::Value,
) {
    let Some(ctx) = NonNull::new(ctx) else {
        return;
    };
    let Some(routine) = (unsafe { routine::<P>(ctx) }) else {
        return;
    };
    let api = unsafe { &*routine.api };
    let context = Context::new(api, ctx);
    let Function::Scalar(func) = &mut routine.function else {
        context.result_error("not a scalar function");
        return;
    };
    let args = Args::new(api, argc, argv);
    let out = catch_unwind(AssertUnwindSafe(|| func.call(&context, &args)));
    if let Some(value) = settle(&context, &routine.name, out) {
        context.result_value(value);
    }
}

fn accumulate<P: Sqlite3Api>(
    ctx: *mut P::Context,
    argc: i32,
    argv: *mut *mut P::Value,
    inverse: bool,
) {
    let Some(ctx) = NonNull::new(ctx) else {
        return;
    };
    let Some(routine) = (unsafe { routine::<P>(ctx) }) else {
        return;
    };
    let api = unsafe { &*routine.api };
    let context = Context::new(api, ctx);
    let slot = unsafe { accumulator_slot::<P>(api, ctx, true) };
    if slot.is_null() {
        context.result_error(OUT_OF_MEMORY);
        return;
    }
    let args = Args::new(api, argc, argv);
    let out = catch_unwind(AssertUnwindSafe(|| {
        if unsafe { (*slot).is_null() } {
            let acc = routine.accumulator()?;
            unsafe { *slot = Box::into_raw(Box::new(acc)) };
        }
        let acc = unsafe { &mut **slot };
        if inverse {
            acc.inverse(&context, &args)
        } else {
            acc.step(&context, &args)
        }
    }));
    settle(&context, &routine.name, out);
}

extern "C" fn step_trampoline<P: Sqlite3Api>(
    ctx: *mut P::Context,
    argc: i32,
    argv: *mut *mut P::Value,
) {
    accumulate::<P>(ctx, argc, argv, false);
}

extern "C" fn inverse_trampoline<P: Sqlite3Api>(
    ctx: *mut P::Context,
    argc: i32,
    argv: *mut *mut P::Value,
) {
    accumulate::<P>(ctx, argc, argv, true);
}

extern "C" fn value_trampoline<P: Sqlite3Api>(ctx: *mut P::Context) {
    let Some(ctx) = NonNull::new(ctx) else {
        return;
    };
    let Some(routine) = (unsafe { routine::<P>(ctx) }) else {
        return;
    };
    let api = unsafe { &*routine.api };
    let context = Context::new(api, ctx);
    let slot = unsafe { accumulator_slot::<P>(api, ctx, true) };
    if slot.is_null() {
        context.result_error(OUT_OF_MEMORY);
        return;
    }
    let out = catch_unwind(AssertUnwindSafe(|| {
        if unsafe { (*slot).is_null() } {
            let acc = routine.accumulator()?;
            unsafe { *slot = Box::into_raw(Box::new(acc)) };
        }
        unsafe { &mut **slot }.value(&context)
    }));
    if let Some(value) = settle(&context, &routine.name, out) {
        context.result_value(value);
    }
}

extern "C" fn final_trampoline<P: Sqlite3Api>(ctx: *mut P::Context) {
    let Some(ctx) = NonNull::new(ctx) else {
        return;
    };
    let Some(routine) = (unsafe { routine::<P>(ctx) }) else {
        return;
    };
    let api = unsafe { &*routine.api };
    let context = Context::new(api, ctx);
    let slot = unsafe { accumulator_slot::<P>(api, ctx, false) };
    // Take ownership before running user code so the state is freed exactly once.
    let taken = if slot.is_null() {
        core::ptr::null_mut()
    } else {
        unsafe { core::mem::replace(&mut *slot, core::ptr::null_mut()) }
    };
    let out = catch_unwind(AssertUnwindSafe(|| {
        let mut acc = if taken.is_null() {
            routine.accumulator()?
        } else {
            *unsafe { Box::from_raw(taken) }
        };
        acc.finalize(&context)
    }));
    if let Some(value) = settle(&context, &routine.name, out) {
        context.result_value(value);
    }
}

/// String comparison used by a named collation sequence.
pub trait Collation: Send + 'static {
    /// Order `lhs` relative to `rhs`.
    fn compare(&mut self, lhs: &str, rhs: &str) -> Ordering;
}

impl<F: FnMut(&str, &str) -> Ordering + Send + 'static> Collation for F {
    fn compare(&mut self, lhs: &str, rhs: &str) -> Ordering {
        self(lhs, rhs)
    }
}

type CollationState = Box<dyn Collation>;

extern "C" fn compare_trampoline(
    ctx: *mut c_void,
    lhs_len: i32,
    lhs: *const c_void,
    rhs_len: i32,
    rhs: *const c_void,
) -> i32 {
    if ctx.is_null() {
        return 0;
    }
    let collation = unsafe { &mut *(ctx as *mut CollationState) };
    let decode = |ptr: *const c_void, len: i32| {
        let raw = RawBytes {
            ptr: ptr as *const u8,
            len: len.max(0) as usize,
        };
        String::from_utf8_lossy(unsafe { raw.as_slice() })
    };
    let lhs = decode(lhs, lhs_len);
    let rhs = decode(rhs, rhs_len);
    match catch_unwind(AssertUnwindSafe(|| collation.compare(&lhs, &rhs))) {
        Ok(ordering) => ordering as i32,
        Err(_) => {
            error!("collation panicked");
            0
        }
    }
}

extern "C" fn drop_boxed<T>(ptr: *mut c_void) {
    if !ptr.is_null() {
        unsafe { drop(Box::from_raw(ptr as *mut T)) };
    }
}

fn validate_arg_count(n_args: i32) -> Result<()> {
    if !(-1..=127).contains(&n_args) {
        return Err(Error::misuse(format!("invalid args provided: {n_args}")));
    }
    Ok(())
}

impl<'p, P: Sqlite3Api> Connection<'p, P> {
    /// Register `function` under `name`, replacing an earlier definition with
    /// the same name and arity. `n_args == -1` accepts any argument count.
    ///
    /// Plain aggregates go through `create_window_function` when the engine
    /// has it, and through `create_function_v2` otherwise.
    pub fn create_function(
        &self,
        name: &str,
        n_args: i32,
        flags: FunctionFlags,
        function: Function<P>,
    ) -> Result<()> {
        validate_name(name)?;
        validate_arg_count(n_args)?;
        let windows = self.api.feature_set().contains(FeatureSet::WINDOW_FUNCTIONS);
        if matches!(function, Function::Window(_)) && !windows {
            return Err(Error::feature_unavailable(
                "create_window_function not available",
            ));
        }
        self.with_db(|db| {
            let is_scalar = matches!(function, Function::Scalar(_));
            let is_window = matches!(function, Function::Window(_));
            let routine = Box::new(Routine {
                api: self.api as *const P,
                name: name.to_owned(),
                function,
            });
            let user_data = Box::into_raw(routine) as *mut c_void;
            let destroy: Option<DestroyCallback> = Some(drop_boxed::<Routine<P>>);
            unsafe {
                if is_scalar {
                    self.api.create_function_v2(
                        db,
                        name,
                        n_args,
                        flags,
                        Some(scalar_trampoline::<P>),
                        None,
                        None,
                        user_data,
                        destroy,
                    )
                } else if is_window {
                    self.api.create_window_function(
                        db,
                        name,
                        n_args,
                        flags,
                        Some(step_trampoline::<P>),
                        Some(final_trampoline::<P>),
                        Some(value_trampoline::<P>),
                        Some(inverse_trampoline::<P>),
                        user_data,
                        destroy,
                    )
                } else if windows {
                    self.api.create_window_function(
                        db,
                        name,
                        n_args,
                        flags,
                        Some(step_trampoline::<P>),
                        Some(final_trampoline::<P>),
                        None,
                        None,
                        user_data,
                        destroy,
                    )
                } else {
                    self.api.create_function_v2(
                        db,
                        name,
                        n_args,
                        flags,
                        None,
                        Some(step_trampoline::<P>),
                        Some(final_trampoline::<P>),
                        user_data,
                        destroy,
                    )
                }
            }
        })
    }

    /// Remove the variadic definition of `name`.
    pub fn destroy_function(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.with_db(|db| unsafe {
            self.api.create_function_v2(
                db,
                name,
                -1,
                FunctionFlags::empty(),
                None,
                None,
                None,
                core::ptr::null_mut(),
                None,
            )
        })
    }

    /// Register a UTF-8 collation sequence.
    pub fn create_collation(&self, name: &str, collation: impl Collation) -> Result<()> {
        validate_name(name)?;
        self.with_db(|db| {
            let state: Box<CollationState> = Box::new(Box::new(collation));
            let context = Box::into_raw(state) as *mut c_void;
            unsafe {
                self.api.create_collation_v2(
                    db,
                    name,
                    context,
                    Some(compare_trampoline),
                    Some(drop_boxed::<CollationState>),
                )
            }
        })
    }

    /// Remove a collation sequence.
    pub fn destroy_collation(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.with_db(|db| unsafe {
            self.api
                .create_collation_v2(db, name, core::ptr::null_mut(), None, None)
        })
    }
}
