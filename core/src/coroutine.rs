//! Coroutine views sharing a root state's heap.
//!
//! A [`Thread`] never owns VM memory: the coroutine object lives in the guest
//! heap and is kept reachable through a bridge-owned registry table until the
//! view is dropped. Closing the root state turns every view inert.

use std::cell::Cell;
use std::ptr;
use std::sync::Arc;

use mlua_sys as ffi;
use tracing::trace;

use crate::error::{Error, LastError, Result};
use crate::stack::{StackOps, live, peek_error_message};
use crate::state::{Shared, THREADS_KEY, registry_table};
use crate::types::{CallbackId, CoStatus};

/// Result of one resume: the new status and how many values the coroutine
/// left on its stack (yielded or returned).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Resume {
    pub status: CoStatus,
    pub nresults: i32,
}

impl Resume {
    fn failed(status: CoStatus) -> Self {
        Self { status, nresults: 0 }
    }
}

pub struct Thread {
    raw: *mut ffi::lua_State,
    shared: Arc<Shared>,
    anchor: u64,
    status: Cell<CoStatus>,
    last_error: LastError,
}

impl Thread {
    /// Create a coroutine on `parent`'s heap. The parent's stack is left as
    /// it was.
    ///
    /// # Safety
    /// `parent` must be null or a live VM handle belonging to `shared`.
    pub(crate) unsafe fn spawn(parent: *mut ffi::lua_State, shared: Arc<Shared>) -> Result<Thread> {
        if parent.is_null() || !shared.is_open() {
            return Err(Error::invalid("state is closed"));
        }
        let anchor = shared.next_anchor();
        let raw = unsafe {
            if ffi::lua_checkstack(parent, 4) == 0 {
                return Err(Error::Memory("no stack space to create a thread".to_string()));
            }
            let raw = ffi::lua_newthread(parent);
            if raw.is_null() {
                return Err(Error::Memory("failed to allocate thread".to_string()));
            }
            let threads = registry_table(parent, THREADS_KEY);
            ffi::lua_pushnumber(parent, anchor as f64);
            ffi::lua_pushvalue(parent, threads - 1);
            ffi::lua_rawset(parent, threads);
            ffi::lua_settop(parent, threads - 2);
            raw
        };
        trace!(state = shared.id(), anchor, "coroutine spawned");
        Ok(Thread {
            raw,
            shared,
            anchor,
            status: Cell::new(CoStatus::Ok),
            last_error: LastError::default(),
        })
    }

    /// Resume with `nargs` values already pushed on this coroutine's stack.
    pub fn resume(&self, nargs: i32) -> Resume {
        self.resume_inner(ptr::null_mut(), nargs)
    }

    /// Like [`Thread::resume`], naming the handle that performs the resume.
    pub fn resume_from(&self, from: &dyn StackOps, nargs: i32) -> Resume {
        self.resume_inner(from.as_ptr(), nargs)
    }

    fn resume_inner(&self, from: *mut ffi::lua_State, nargs: i32) -> Resume {
        self.last_error.clear();
        let Some(co) = live(self) else {
            self.last_error.set("state is closed");
            return Resume::failed(CoStatus::ErrRun);
        };
        // A faulted coroutine cannot be resumed again; report the same error
        // without entering the VM.
        let current = self.status.get();
        if current.is_error() {
            self.last_error.set(format!("cannot resume dead coroutine ({:?})", current));
            return Resume::failed(current);
        }

        let mut nresults: i32 = 0;
        let slot = self.shared.callback_slot();
        let code = unsafe { ffi::lua_resume(co, from, nargs.max(0), &mut nresults) };
        self.shared.leave_callback(slot);
        let status = CoStatus::from_vm(code);
        self.status.set(status);
        if status.is_error() {
            let message = unsafe { peek_error_message(co) }.unwrap_or_else(|| "Runtime error".to_string());
            // A faulted coroutine is left with no free slots; reserve some so
            // the host can keep pushing and reading on it.
            unsafe { ffi::lua_checkstack(co, ffi::LUA_MINSTACK) };
            trace!(state = self.shared.id(), anchor = self.anchor, ?status, "coroutine faulted");
            self.last_error.set(message);
            return Resume::failed(status);
        }
        Resume { status, nresults: nresults.max(0) }
    }

    /// Status after the last resume; `Ok` before the first one.
    pub fn status(&self) -> CoStatus {
        if live(self).is_none() {
            return CoStatus::ErrRun;
        }
        self.status.get()
    }

    pub fn is_alive(&self) -> bool {
        self.shared.is_open()
    }

    /// Id of the root state whose heap this coroutine shares.
    pub fn state_id(&self) -> u64 {
        self.shared.id()
    }

    pub fn callback_id(&self) -> Option<CallbackId> {
        self.shared.current_callback()
    }

    /// Spawn a sibling coroutine on the same heap.
    pub fn new_thread(&self) -> Result<Thread> {
        unsafe { Thread::spawn(self.as_ptr(), Arc::clone(&self.shared)) }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl StackOps for Thread {
    fn as_ptr(&self) -> *mut ffi::lua_State {
        if self.shared.is_open() { self.raw } else { ptr::null_mut() }
    }

    fn last_error_slot(&self) -> &LastError {
        &self.last_error
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // Only the anchor goes; the coroutine itself is collected by the VM.
        if !self.shared.is_open() {
            return;
        }
        unsafe {
            let main = ffi::lua_mainthread(self.raw);
            if ffi::lua_checkstack(main, 3) == 0 {
                return;
            }
            let top = ffi::lua_gettop(main);
            let threads = registry_table(main, THREADS_KEY);
            ffi::lua_pushnumber(main, self.anchor as f64);
            ffi::lua_pushnil(main);
            ffi::lua_rawset(main, threads);
            ffi::lua_settop(main, top);
        }
        trace!(state = self.shared.id(), anchor = self.anchor, "coroutine released");
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("state", &self.shared.id())
            .field("anchor", &self.anchor)
            .field("status", &self.status.get())
            .finish()
    }
}
