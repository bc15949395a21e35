//! External callback dispatcher and native function trampolines.
//!
//! The VM gives each native closure one C function pointer plus a few
//! captured upvalues. Every registered host function shares one of two fixed
//! trampolines; which host function runs is decided by the upvalues:
//!
//! - native functions capture the Rust function pointer as light userdata;
//! - external functions capture a [`CallbackId`] split into two 32-bit
//!   halves, since guest numbers are doubles and cannot carry 64 bits.
//!
//! An external call recovers the owning state through the registry, records
//! the identifier as the running callback, forwards to the state's single
//! [`Dispatcher`] and hands its declared result count back to the VM.

use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use mlua_sys as ffi;
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use tracing::{trace, warn};

use crate::coroutine::Thread;
use crate::error::{Error, LastError, Result};
use crate::stack::{StackOps, push_lstring};
use crate::state::{Shared, shared_for};
use crate::types::CallbackId;

/// Signature of a Rust function callable from guest code.
pub type NativeFn = fn(&Frame) -> Result<Outcome>;

/// Boxed host function stored in a [`FunctionTable`].
pub type HostFn = dyn Fn(&Frame) -> Result<Outcome> + Send + Sync;

/// Value returned by native and dispatched functions to the VM.
///
/// Either a count of results already pushed on the frame, or the marker
/// produced by [`Frame::yield_values`]. A yield must be *returned*: the VM
/// suspends the coroutine only when the native function hands it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome(c_int);

impl Outcome {
    pub const NONE: Outcome = Outcome(0);

    pub fn returns(count: i32) -> Outcome {
        Outcome(count.max(0))
    }

    pub(crate) fn from_raw(raw: c_int) -> Outcome {
        Outcome(raw)
    }

    pub fn is_yield(self) -> bool {
        self.0 < 0
    }

    pub fn raw(self) -> c_int {
        self.0
    }
}

/// Receives every external call made by guest code on one root state.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, frame: &Frame, id: CallbackId) -> Result<Outcome>;

    /// Whether the trampoline converts host panics into guest errors.
    ///
    /// Dispatchers that raise guest errors by unwinding straight through the
    /// trampoline (foreign callers using `lbridge_error`) return `false`.
    fn catch_panics(&self) -> bool {
        true
    }
}

impl<D: Dispatcher + ?Sized> Dispatcher for Arc<D> {
    fn dispatch(&self, frame: &Frame, id: CallbackId) -> Result<Outcome> {
        (**self).dispatch(frame, id)
    }

    fn catch_panics(&self) -> bool {
        (**self).catch_panics()
    }
}

/// Adapts a closure into a [`Dispatcher`].
pub struct FnDispatcher<F>(F);

impl<F> FnDispatcher<F>
where
    F: Fn(&Frame, CallbackId) -> Result<Outcome> + Send + Sync,
{
    pub fn new(dispatch: F) -> Self {
        FnDispatcher(dispatch)
    }
}

impl<F> Dispatcher for FnDispatcher<F>
where
    F: Fn(&Frame, CallbackId) -> Result<Outcome> + Send + Sync,
{
    fn dispatch(&self, frame: &Frame, id: CallbackId) -> Result<Outcome> {
        (self.0)(frame, id)
    }
}

/// Dispatcher that maps identifiers to Rust closures.
///
/// Identifiers are handed out sequentially from 1. Share the table with
/// `Arc` to keep inserting functions after it has been installed.
pub struct FunctionTable {
    functions: RwLock<FxHashMap<CallbackId, (Arc<str>, Arc<HostFn>)>>,
    next_id: AtomicU64,
}

impl Default for FunctionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionTable {
    pub fn new() -> Self {
        Self {
            functions: RwLock::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Store `func` and return the identifier to register it under.
    pub fn insert<F>(&self, name: &str, func: F) -> CallbackId
    where
        F: Fn(&Frame) -> Result<Outcome> + Send + Sync + 'static,
    {
        self.insert_shared(name, Arc::new(func))
    }

    /// [`FunctionTable::insert`] for an already shared function.
    pub fn insert_shared(&self, name: &str, func: Arc<HostFn>) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = (Arc::<str>::from(name), func);
        match self.functions.write() {
            Ok(mut guard) => guard.insert(id, entry),
            Err(poisoned) => poisoned.into_inner().insert(id, entry),
        };
        id
    }

    pub fn remove(&self, id: CallbackId) -> bool {
        match self.functions.write() {
            Ok(mut guard) => guard.remove(&id).is_some(),
            Err(poisoned) => poisoned.into_inner().remove(&id).is_some(),
        }
    }

    pub fn name_of(&self, id: CallbackId) -> Option<Arc<str>> {
        self.lookup(id).map(|(name, _)| name)
    }

    pub fn len(&self) -> usize {
        match self.functions.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, id: CallbackId) -> Option<(Arc<str>, Arc<HostFn>)> {
        let guard = match self.functions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.get(&id).cloned()
    }
}

impl std::fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTable").field("len", &self.len()).finish()
    }
}

impl Dispatcher for FunctionTable {
    fn dispatch(&self, frame: &Frame, id: CallbackId) -> Result<Outcome> {
        // The lock is released before the call so the function may re-enter
        // the table (or the VM) freely.
        let Some((name, func)) = self.lookup(id) else {
            warn!(callback = id.0, "no host function registered for callback id");
            return Ok(Outcome::NONE);
        };
        trace!(callback = id.0, function = %name, "calling host function");
        func(frame)
    }
}

/// Tagged registration target: a direct native function or a dispatcher
/// identifier.
#[derive(Debug, Clone, Copy)]
pub enum Registration {
    Native(NativeFn),
    External(CallbackId),
}

/// One named entry of a bulk registration.
#[derive(Debug, Clone, Copy)]
pub struct FuncReg<'a> {
    pub name: &'a str,
    pub func: Registration,
}

impl<'a> FuncReg<'a> {
    pub const fn native(name: &'a str, func: NativeFn) -> Self {
        Self {
            name,
            func: Registration::Native(func),
        }
    }

    pub const fn external(name: &'a str, id: CallbackId) -> Self {
        Self {
            name,
            func: Registration::External(id),
        }
    }
}

/// Borrowed view of the VM stack handed to native and dispatched functions.
///
/// Slot 1 is the first argument. Values pushed before returning become the
/// results, as many as the returned [`Outcome`] declares.
pub struct Frame {
    raw: *mut ffi::lua_State,
    shared: Option<Arc<Shared>>,
    last_error: LastError,
}

impl Frame {
    pub(crate) fn new(raw: *mut ffi::lua_State, shared: Option<Arc<Shared>>) -> Self {
        Self {
            raw,
            shared,
            last_error: LastError::default(),
        }
    }

    pub(crate) fn reborrow(&self) -> Frame {
        Frame::new(self.raw, self.shared.clone())
    }

    pub(crate) fn shared(&self) -> Option<&Arc<Shared>> {
        self.shared.as_ref()
    }

    /// Number of arguments passed by the guest.
    pub fn arg_count(&self) -> i32 {
        self.top()
    }

    /// Identifier of the external function being dispatched, `None` inside a
    /// plain native function.
    pub fn callback_id(&self) -> Option<CallbackId> {
        self.shared.as_ref().and_then(|shared| shared.current_callback())
    }

    /// Id of the root state this frame runs in.
    pub fn state_id(&self) -> Option<u64> {
        self.shared.as_ref().map(|shared| shared.id())
    }

    /// Suspend the running coroutine, handing the top `count` values to the
    /// resumer. The returned outcome must be returned from the function.
    pub fn yield_values(&self, count: i32) -> Result<Outcome> {
        if !self.is_yieldable() {
            return Err(Error::runtime("attempt to yield from outside a coroutine"));
        }
        let count = count.clamp(0, self.top());
        Ok(Outcome(unsafe { ffi::lua_yield(self.raw, count) }))
    }

    /// Spawn a coroutine sharing this frame's heap.
    pub fn new_thread(&self) -> Result<Thread> {
        let Some(shared) = self.shared.clone() else {
            return Err(Error::invalid("frame is not attached to a bridge state"));
        };
        unsafe { Thread::spawn(self.raw, shared) }
    }
}

impl StackOps for Frame {
    fn as_ptr(&self) -> *mut ffi::lua_State {
        match &self.shared {
            Some(shared) if !shared.is_open() => ptr::null_mut(),
            _ => self.raw,
        }
    }

    fn last_error_slot(&self) -> &LastError {
        &self.last_error
    }
}

struct CallbackScope<'a> {
    shared: &'a Shared,
    previous: u64,
}

impl<'a> CallbackScope<'a> {
    fn enter(shared: &'a Shared, id: CallbackId) -> Self {
        let previous = shared.enter_callback(id);
        Self { shared, previous }
    }
}

impl Drop for CallbackScope<'_> {
    fn drop(&mut self) {
        self.shared.leave_callback(self.previous);
    }
}

static DEBUG_NAMES: Lazy<DashMap<String, &'static CStr>> = Lazy::new(DashMap::new);

/// The VM keeps the debug-name pointer of a closure without copying it, so
/// names are interned for the life of the process.
pub(crate) fn debug_name(name: &str) -> *const c_char {
    if name.is_empty() {
        return ptr::null();
    }
    if let Some(found) = DEBUG_NAMES.get(name) {
        return found.value().as_ptr();
    }
    let Ok(owned) = CString::new(name) else {
        return ptr::null();
    };
    let leaked: &'static CStr = Box::leak(owned.into_boxed_c_str());
    let interned: &'static CStr = *DEBUG_NAMES.entry(name.to_string()).or_insert(leaked);
    interned.as_ptr()
}

/// # Safety
/// `l` must be a live VM handle with two free stack slots.
pub(crate) unsafe fn push_native(l: *mut ffi::lua_State, func: NativeFn, name: &str) {
    unsafe {
        ffi::lua_pushlightuserdata(l, func as *const () as *mut c_void);
        ffi::lua_pushcclosurek(l, native_trampoline, debug_name(name), 1, None);
    }
}

/// # Safety
/// `l` must be a live VM handle with three free stack slots.
pub(crate) unsafe fn push_external(l: *mut ffi::lua_State, id: CallbackId, name: &str) {
    let (low, high) = id.split();
    unsafe {
        ffi::lua_pushnumber(l, f64::from(low));
        ffi::lua_pushnumber(l, f64::from(high));
        ffi::lua_pushcclosurek(l, external_trampoline, debug_name(name), 2, None);
    }
}

/// # Safety
/// `l` must be a live VM handle with three free stack slots.
pub(crate) unsafe fn push_registration(l: *mut ffi::lua_State, reg: &FuncReg<'_>) {
    match reg.func {
        Registration::Native(func) => unsafe { push_native(l, func, reg.name) },
        Registration::External(id) => unsafe { push_external(l, id, reg.name) },
    }
}

unsafe extern "C-unwind" fn native_trampoline(l: *mut ffi::lua_State) -> c_int {
    let result = unsafe { call_native(l) };
    unsafe { finish(l, result) }
}

unsafe extern "C-unwind" fn external_trampoline(l: *mut ffi::lua_State) -> c_int {
    let result = unsafe { call_external(l) };
    unsafe { finish(l, result) }
}

unsafe fn call_native(l: *mut ffi::lua_State) -> std::result::Result<c_int, String> {
    let raw = unsafe { ffi::lua_touserdata(l, ffi::lua_upvalueindex(1)) };
    if raw.is_null() {
        return Ok(0);
    }
    let func = unsafe { std::mem::transmute::<*mut c_void, NativeFn>(raw) };
    let frame = Frame::new(l, unsafe { shared_for(l) });
    guarded(&frame, || func(&frame))
}

unsafe fn call_external(l: *mut ffi::lua_State) -> std::result::Result<c_int, String> {
    let Some(shared) = (unsafe { shared_for(l) }) else {
        return Ok(0);
    };
    let id = unsafe { CallbackId::join(upvalue_u32(l, 1), upvalue_u32(l, 2)) };
    let Some(dispatcher) = shared.dispatcher() else {
        trace!(state = shared.id(), callback = id.0, "external call with no dispatcher");
        return Ok(0);
    };

    trace!(state = shared.id(), callback = id.0, "dispatching external call");
    let frame = Frame::new(l, Some(Arc::clone(&shared)));
    let _scope = CallbackScope::enter(&shared, id);
    if dispatcher.catch_panics() {
        guarded(&frame, || dispatcher.dispatch(&frame, id))
    } else {
        let outcome = dispatcher.dispatch(&frame, id).map_err(|err| err.message().to_string())?;
        Ok(clamp_results(&frame, outcome))
    }
}

/// Catches Rust panics only. VM errors cannot unwind through here: frame
/// operations that may raise run under their own protected calls and come
/// back as `Err`.
fn guarded<F>(frame: &Frame, call: F) -> std::result::Result<c_int, String>
where
    F: FnOnce() -> Result<Outcome>,
{
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(outcome)) => Ok(clamp_results(frame, outcome)),
        Ok(Err(err)) => Err(err.message().to_string()),
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("host function panicked: {}", detail))
        }
    }
}

/// A declared count larger than what was pushed would expose slots below
/// the frame, so it is capped at the frame's top.
fn clamp_results(frame: &Frame, outcome: Outcome) -> c_int {
    if outcome.is_yield() {
        return outcome.raw();
    }
    outcome.raw().min(frame.top())
}

unsafe fn upvalue_u32(l: *mut ffi::lua_State, n: c_int) -> u32 {
    let value = unsafe { ffi::lua_tonumberx(l, ffi::lua_upvalueindex(n), ptr::null_mut()) };
    value as u32
}

/// Raises `result`'s error as a guest error; the message is copied onto the
/// VM stack and dropped before the non-local exit.
unsafe fn finish(l: *mut ffi::lua_State, result: std::result::Result<c_int, String>) -> c_int {
    match result {
        Ok(count) => count,
        Err(message) => {
            unsafe { push_lstring(l, message.as_bytes()) };
            drop(message);
            unsafe { ffi::lua_error(l) }
        }
    }
}
