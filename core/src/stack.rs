//! Stack marshalling between host values and VM stack slots.
//!
//! Slot indices follow the VM convention unchanged: `1` is the bottom-most
//! slot of the current frame and `-1` the top. Every operation on a closed or
//! invalidated handle is a no-op or yields the zero value (`0`, `false`,
//! `None`, `Type::Nil`), so host code never needs a liveness check first.

use std::ffi::{c_char, c_int};
use std::fmt::Write as _;
use std::ptr;

use mlua_sys as ffi;

use crate::dispatch::{self, NativeFn};
use crate::error::LastError;
use crate::types::{CallbackId, Type};

/// Stack access shared by [`State`](crate::State), [`Thread`](crate::Thread)
/// and [`Frame`](crate::Frame).
pub trait StackOps {
    /// Raw VM handle, null once the owning root state has been closed.
    fn as_ptr(&self) -> *mut ffi::lua_State;

    #[doc(hidden)]
    fn last_error_slot(&self) -> &LastError;

    /// Message of the last failed operation on this handle.
    fn last_error(&self) -> Option<String> {
        self.last_error_slot().get()
    }

    fn clear_error(&self) {
        self.last_error_slot().clear();
    }

    // Stack manipulation

    fn top(&self) -> i32 {
        let Some(l) = live(self) else { return 0 };
        unsafe { ffi::lua_gettop(l) }
    }

    /// Truncate or extend (with nils) the stack to `idx`; negative values are
    /// relative to the current top.
    fn set_top(&self, idx: i32) {
        let Some(l) = live(self) else { return };
        unsafe { ffi::lua_settop(l, idx) };
    }

    fn pop(&self, n: i32) {
        if n <= 0 {
            return;
        }
        self.set_top(-n - 1);
    }

    /// Push a copy of the value at `idx`.
    fn push_value(&self, idx: i32) {
        let Some(l) = live(self) else { return };
        unsafe { ffi::lua_pushvalue(l, idx) };
    }

    /// Remove the value at `idx`, shifting the values above it down.
    fn remove(&self, idx: i32) {
        let Some(l) = live(self) else { return };
        unsafe { ffi::lua_remove(l, idx) };
    }

    /// Move the top value into `idx`, shifting the values above it up.
    fn insert(&self, idx: i32) {
        let Some(l) = live(self) else { return };
        unsafe { ffi::lua_insert(l, idx) };
    }

    fn abs_index(&self, idx: i32) -> i32 {
        let Some(l) = live(self) else { return 0 };
        unsafe { ffi::lua_absindex(l, idx) }
    }

    /// Ensure room for `extra` more slots.
    fn check_stack(&self, extra: i32) -> bool {
        let Some(l) = live(self) else { return false };
        unsafe { ffi::lua_checkstack(l, extra) != 0 }
    }

    /// Move the top `n` values of this stack onto `to`. Both handles must
    /// belong to the same root state.
    fn xmove_to(&self, to: &dyn StackOps, n: i32) {
        let (Some(from), Some(dest)) = (live(self), live(to)) else {
            return;
        };
        if n <= 0 || from == dest {
            return;
        }
        unsafe { ffi::lua_xmove(from, dest, n) };
    }

    // Type queries

    fn type_of(&self, idx: i32) -> Type {
        let Some(l) = live(self) else { return Type::Nil };
        Type::from_vm(unsafe { ffi::lua_type(l, idx) })
    }

    fn type_name(&self, idx: i32) -> &'static str {
        self.type_of(idx).name()
    }

    /// Closed handles report `true`: there is nothing but nil to observe.
    fn is_nil(&self, idx: i32) -> bool {
        self.type_of(idx) == Type::Nil
    }

    fn is_boolean(&self, idx: i32) -> bool {
        self.type_of(idx) == Type::Boolean
    }

    /// True for numbers and for strings convertible to a number.
    fn is_number(&self, idx: i32) -> bool {
        let Some(l) = live(self) else { return false };
        unsafe { ffi::lua_isnumber(l, idx) != 0 }
    }

    /// True for strings and numbers, matching the VM's coercion rules.
    fn is_string(&self, idx: i32) -> bool {
        let Some(l) = live(self) else { return false };
        unsafe { ffi::lua_isstring(l, idx) != 0 }
    }

    fn is_table(&self, idx: i32) -> bool {
        self.type_of(idx) == Type::Table
    }

    fn is_function(&self, idx: i32) -> bool {
        self.type_of(idx) == Type::Function
    }

    // Push values

    fn push_nil(&self) {
        let Some(l) = live(self) else { return };
        unsafe { ffi::lua_pushnil(l) };
    }

    fn push_boolean(&self, b: bool) {
        let Some(l) = live(self) else { return };
        unsafe { ffi::lua_pushboolean(l, c_int::from(b)) };
    }

    fn push_number(&self, n: f64) {
        let Some(l) = live(self) else { return };
        unsafe { ffi::lua_pushnumber(l, n) };
    }

    /// Guest numbers are doubles: integers round-trip exactly within ±2^53.
    fn push_integer(&self, n: i64) {
        self.push_number(n as f64);
    }

    /// Push a byte string of explicit length; embedded zero bytes survive.
    fn push_bytes(&self, bytes: &[u8]) {
        let Some(l) = live(self) else { return };
        unsafe { push_lstring(l, bytes) };
    }

    fn push_string(&self, s: &str) {
        self.push_bytes(s.as_bytes());
    }

    /// Push `func` as a guest function; `name` shows up in guest tracebacks.
    fn push_function(&self, func: NativeFn, name: &str) {
        let Some(l) = live(self) else { return };
        unsafe { dispatch::push_native(l, func, name) };
    }

    /// Push a guest function that forwards to the dispatcher with `id`.
    fn push_external(&self, id: CallbackId, name: &str) {
        let Some(l) = live(self) else { return };
        unsafe { dispatch::push_external(l, id, name) };
    }

    // Read values

    /// Lua truthiness: only `nil` and `false` are false.
    fn to_boolean(&self, idx: i32) -> bool {
        let Some(l) = live(self) else { return false };
        unsafe { ffi::lua_toboolean(l, idx) != 0 }
    }

    /// Returns 0 when the value is not convertible; never faults.
    fn to_number(&self, idx: i32) -> f64 {
        let Some(l) = live(self) else { return 0.0 };
        let mut isnum: c_int = 0;
        let n = unsafe { ffi::lua_tonumberx(l, idx, &mut isnum) };
        if isnum == 0 { 0.0 } else { n }
    }

    /// Truncates toward zero; 0 on type mismatch.
    fn to_integer(&self, idx: i32) -> i64 {
        let n = self.to_number(idx);
        if n.is_finite() { n as i64 } else { 0 }
    }

    /// Bytes of a string (or number, converted in place by the VM);
    /// `None` on type mismatch.
    fn to_bytes(&self, idx: i32) -> Option<Vec<u8>> {
        let Some(l) = live(self) else { return None };
        let (data, len) = unsafe { raw_lstring(l, idx) };
        if data.is_null() {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(data.cast::<u8>(), len) }.to_vec())
    }

    /// UTF-8 view of [`StackOps::to_bytes`]; `None` for non-strings and
    /// invalid UTF-8.
    fn to_string(&self, idx: i32) -> Option<String> {
        self.to_bytes(idx).and_then(|bytes| String::from_utf8(bytes).ok())
    }

    /// Byte length of a string value, 0 for anything else.
    fn string_len(&self, idx: i32) -> usize {
        if self.type_of(idx) != Type::String {
            return 0;
        }
        let Some(l) = live(self) else { return 0 };
        unsafe { ffi::lua_objlen(l, idx) as usize }
    }

    // Heap

    /// Heap size in bytes: whole kilobytes times 1024 plus the remainder.
    fn memory_usage(&self) -> usize {
        let Some(l) = live(self) else { return 0 };
        let kbytes = unsafe { ffi::lua_gc(l, ffi::LUA_GCCOUNT, 0) };
        let remainder = unsafe { ffi::lua_gc(l, ffi::LUA_GCCOUNTB, 0) };
        kbytes.max(0) as usize * 1024 + remainder.max(0) as usize
    }

    /// Run a full garbage-collection cycle.
    fn collect_garbage(&self) {
        let Some(l) = live(self) else { return };
        unsafe { ffi::lua_gc(l, ffi::LUA_GCCOLLECT, 0) };
    }

    // Threads

    fn is_main_thread(&self) -> bool {
        let Some(l) = live(self) else { return false };
        unsafe { ffi::lua_mainthread(l) == l }
    }

    /// False on the main thread and inside non-yieldable regions such as
    /// some metamethods. Reported, never controlled, by the bridge.
    fn is_yieldable(&self) -> bool {
        let Some(l) = live(self) else { return false };
        // The VM reports an idle main thread as yieldable; it never is.
        unsafe { ffi::lua_mainthread(l) != l && ffi::lua_isyieldable(l) != 0 }
    }

    // Debug

    /// Human-readable listing of every slot, bottom to top.
    fn dump_stack(&self) -> String {
        let Some(l) = live(self) else { return String::new() };
        let top = unsafe { ffi::lua_gettop(l) };
        let mut out = String::with_capacity(16 + top.max(0) as usize * 24);
        let _ = writeln!(out, "Stack size: {}", top);
        let mut numbuf = ryu::Buffer::new();
        for idx in 1..=top {
            let _ = write!(out, "[{}] ", idx);
            match self.type_of(idx) {
                Type::String => {
                    let text = self
                        .to_bytes(idx)
                        .map(|b| String::from_utf8_lossy(&b).into_owned())
                        .unwrap_or_default();
                    let _ = write!(out, "string: {:?}", text);
                }
                Type::Boolean => {
                    let _ = write!(out, "boolean: {}", self.to_boolean(idx));
                }
                Type::Number => {
                    let _ = write!(out, "number: {}", numbuf.format(self.to_number(idx)));
                }
                other => out.push_str(other.name()),
            }
            out.push('\n');
        }
        out
    }
}

#[inline]
pub(crate) fn live<S: StackOps + ?Sized>(s: &S) -> Option<*mut ffi::lua_State> {
    let l = s.as_ptr();
    if l.is_null() { None } else { Some(l) }
}

/// # Safety
/// `l` must be a live VM handle.
pub(crate) unsafe fn push_lstring(l: *mut ffi::lua_State, bytes: &[u8]) {
    let data = if bytes.is_empty() {
        c"".as_ptr()
    } else {
        bytes.as_ptr().cast::<c_char>()
    };
    unsafe { ffi::lua_pushlstring(l, data, bytes.len()) };
}

/// Pointer and length of the string at `idx`, valid until the value is
/// removed from the stack. Null for non-strings.
///
/// # Safety
/// `l` must be a live VM handle.
pub(crate) unsafe fn raw_lstring(l: *mut ffi::lua_State, idx: c_int) -> (*const c_char, usize) {
    let mut len: usize = 0;
    let data = unsafe { ffi::lua_tolstring(l, idx, &mut len) };
    if data.is_null() { (ptr::null(), 0) } else { (data, len) }
}

/// Takes the error value from the top of the stack as text and pops it.
///
/// # Safety
/// `l` must be a live VM handle with the error value on top.
pub(crate) unsafe fn pop_error_message(l: *mut ffi::lua_State, fallback: &str) -> String {
    let message = unsafe { peek_error_message(l) };
    unsafe { ffi::lua_settop(l, -2) };
    message.unwrap_or_else(|| fallback.to_string())
}

/// # Safety
/// `l` must be a live VM handle.
pub(crate) unsafe fn peek_error_message(l: *mut ffi::lua_State) -> Option<String> {
    if unsafe { ffi::lua_isstring(l, -1) } == 0 {
        return None;
    }
    let (data, len) = unsafe { raw_lstring(l, -1) };
    if data.is_null() || len == 0 {
        return None;
    }
    let bytes = unsafe { std::slice::from_raw_parts(data.cast::<u8>(), len) };
    Some(String::from_utf8_lossy(bytes).into_owned())
}
