//! Root state wrapper and the side table that lets native trampolines find it.
//!
//! Every root registers a numeric id in the VM registry under
//! [`STATE_KEY`]. A trampoline only receives the bare VM handle, so it reads
//! that id back and resolves the bridge metadata through [`STATES`] instead of
//! round-tripping a wrapper pointer through guest memory.

use std::ffi::{CStr, c_int};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use mlua_sys as ffi;
use once_cell::sync::Lazy;
use tracing::{debug, warn};

use crate::coroutine::Thread;
use crate::dispatch::{Dispatcher, FnDispatcher, Frame, Outcome};
use crate::error::{Error, LastError, Result};
use crate::stack::StackOps;
use crate::types::CallbackId;

pub(crate) const STATE_KEY: &CStr = c"_luau_bridge_state";
pub(crate) const THREADS_KEY: &CStr = c"_luau_bridge_threads";

static STATES: Lazy<DashMap<u64, Arc<Shared>>> = Lazy::new(DashMap::new);
static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(1);

/// Bridge metadata shared by a root state and every coroutine spawned from it.
pub(crate) struct Shared {
    id: u64,
    open: AtomicBool,
    dispatcher: RwLock<Option<Arc<dyn Dispatcher>>>,
    current_callback: AtomicU64,
    next_anchor: AtomicU64,
}

impl Shared {
    fn new(id: u64) -> Self {
        Self {
            id,
            open: AtomicBool::new(true),
            dispatcher: RwLock::new(None),
            current_callback: AtomicU64::new(0),
            next_anchor: AtomicU64::new(1),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn dispatcher(&self) -> Option<Arc<dyn Dispatcher>> {
        match self.dispatcher.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn replace_dispatcher(&self, dispatcher: Option<Arc<dyn Dispatcher>>) {
        match self.dispatcher.write() {
            Ok(mut guard) => *guard = dispatcher,
            Err(poisoned) => *poisoned.into_inner() = dispatcher,
        }
    }

    /// Marks `id` as the running callback and returns the previous one so a
    /// nested call can restore it.
    pub(crate) fn enter_callback(&self, id: CallbackId) -> u64 {
        self.current_callback.swap(id.0, Ordering::AcqRel)
    }

    pub(crate) fn leave_callback(&self, previous: u64) {
        self.current_callback.store(previous, Ordering::Release);
    }

    /// Raw slot value, for restoring it around a protected boundary.
    pub(crate) fn callback_slot(&self) -> u64 {
        self.current_callback.load(Ordering::Acquire)
    }

    pub(crate) fn current_callback(&self) -> Option<CallbackId> {
        match self.current_callback.load(Ordering::Acquire) {
            0 => None,
            id => Some(CallbackId(id)),
        }
    }

    pub(crate) fn next_anchor(&self) -> u64 {
        self.next_anchor.fetch_add(1, Ordering::Relaxed)
    }
}

/// Resolves the owning root metadata from a raw VM handle (root or coroutine).
///
/// # Safety
/// `l` must be a live VM handle with one free stack slot.
pub(crate) unsafe fn shared_for(l: *mut ffi::lua_State) -> Option<Arc<Shared>> {
    if l.is_null() {
        return None;
    }
    let id = unsafe {
        ffi::lua_getfield(l, ffi::LUA_REGISTRYINDEX, STATE_KEY.as_ptr());
        let id = ffi::lua_tonumberx(l, -1, ptr::null_mut());
        ffi::lua_settop(l, -2);
        id
    };
    if id < 1.0 {
        return None;
    }
    STATES.get(&(id as u64)).map(|entry| Arc::clone(entry.value()))
}

/// Owning wrapper around one Luau VM.
///
/// Destroys the VM exactly once, on [`State::close`] or drop. Access from more
/// than one thread at a time is undefined behaviour on the VM side, so the
/// wrapper is `Send` but not `Sync`: callers serialize access themselves.
pub struct State {
    raw: *mut ffi::lua_State,
    shared: Arc<Shared>,
    last_error: LastError,
}

// The VM has no thread affinity; it only forbids concurrent use.
unsafe impl Send for State {}

impl State {
    /// Create a new VM. Allocation failure yields `Error::Memory` and no
    /// partially-built wrapper.
    pub fn new() -> Result<Self> {
        let raw = unsafe { ffi::luaL_newstate() };
        if raw.is_null() {
            return Err(Error::Memory("failed to allocate Luau state".to_string()));
        }

        let id = NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed);
        unsafe {
            ffi::lua_pushnumber(raw, id as f64);
            ffi::lua_setfield(raw, ffi::LUA_REGISTRYINDEX, STATE_KEY.as_ptr());
        }

        let shared = Arc::new(Shared::new(id));
        STATES.insert(id, Arc::clone(&shared));
        debug!(state = id, "luau state created");

        Ok(State {
            raw,
            shared,
            last_error: LastError::default(),
        })
    }

    /// Install the guest's built-in libraries into the global namespace.
    ///
    /// No filtering happens here; sandboxing is done afterwards by the caller,
    /// e.g. with [`TableOps::remove_global`](crate::TableOps::remove_global).
    pub fn open_libs(&self) {
        if self.raw.is_null() {
            return;
        }
        unsafe { ffi::luaL_openlibs(self.raw) };
    }

    /// Destroy the VM. Idempotent; every [`Thread`] spawned from this state
    /// turns into an inert view afterwards.
    pub fn close(&mut self) {
        if self.raw.is_null() {
            return;
        }
        self.shared.open.store(false, Ordering::Release);
        self.shared.replace_dispatcher(None);
        STATES.remove(&self.shared.id);
        unsafe { ffi::lua_close(self.raw) };
        self.raw = ptr::null_mut();
        debug!(state = self.shared.id, "luau state closed");
    }

    pub fn is_closed(&self) -> bool {
        self.raw.is_null()
    }

    /// Process-unique id of this state, as stored in the VM registry.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Install the single dispatcher that receives every external call.
    /// Replaces any previous dispatcher.
    pub fn set_dispatcher<D: Dispatcher + 'static>(&self, dispatcher: D) {
        if self.raw.is_null() {
            return;
        }
        self.shared.replace_dispatcher(Some(Arc::new(dispatcher)));
    }

    /// Closure form of [`State::set_dispatcher`].
    pub fn set_dispatch_fn<F>(&self, dispatch: F)
    where
        F: Fn(&Frame, CallbackId) -> Result<Outcome> + Send + Sync + 'static,
    {
        self.set_dispatcher(FnDispatcher::new(dispatch));
    }

    /// Remove the dispatcher; external calls then return no results.
    pub fn clear_dispatcher(&self) {
        self.shared.replace_dispatcher(None);
    }

    pub fn has_dispatcher(&self) -> bool {
        self.shared.dispatcher().is_some()
    }

    /// Identifier of the external function currently executing, if any.
    pub fn callback_id(&self) -> Option<CallbackId> {
        self.shared.current_callback()
    }

    /// Spawn a coroutine sharing this state's heap.
    pub fn new_thread(&self) -> Result<Thread> {
        self.last_error.clear();
        unsafe { Thread::spawn(self.raw, Arc::clone(&self.shared)) }.map_err(|err| self.fail(err))
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    fn fail(&self, err: Error) -> Error {
        self.last_error.set(err.message());
        err
    }
}

impl StackOps for State {
    fn as_ptr(&self) -> *mut ffi::lua_State {
        self.raw
    }

    fn last_error_slot(&self) -> &LastError {
        &self.last_error
    }
}

impl Drop for State {
    fn drop(&mut self) {
        if Arc::strong_count(&self.shared) > 2 && !self.raw.is_null() {
            warn!(
                state = self.shared.id,
                "closing luau state while coroutine views are still alive"
            );
        }
        self.close();
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("id", &self.shared.id)
            .field("closed", &self.raw.is_null())
            .finish()
    }
}

/// Leaves the bridge-owned registry table `key` on top of the stack, creating
/// it on first use, and returns its absolute index.
///
/// # Safety
/// `l` must be a live VM handle with two free stack slots.
pub(crate) unsafe fn registry_table(l: *mut ffi::lua_State, key: &CStr) -> c_int {
    unsafe {
        ffi::lua_getfield(l, ffi::LUA_REGISTRYINDEX, key.as_ptr());
        if ffi::lua_type(l, -1) != ffi::LUA_TTABLE {
            ffi::lua_settop(l, -2);
            ffi::lua_createtable(l, 0, 4);
            ffi::lua_pushvalue(l, -1);
            ffi::lua_setfield(l, ffi::LUA_REGISTRYINDEX, key.as_ptr());
        }
        ffi::lua_gettop(l)
    }
}
