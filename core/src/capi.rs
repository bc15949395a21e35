//! Flat C-callable surface.
//!
//! Every `lbridge_*` function accepts a null handle: it then does nothing and
//! returns a zero value, `NULL` or `InvalidArgument`. Fallible functions
//! return an [`ErrorCode`]; the message is fetched with [`lbridge_geterror`].
//!
//! Native and external functions receive a borrowed handle bound to the
//! running call frame. That handle is valid only for the duration of the
//! call and must not be passed to [`lbridge_close`].

use std::cell::RefCell;
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::ptr;
use std::sync::Arc;

use dashmap::DashMap;
use mlua_sys as ffi;
use once_cell::sync::Lazy;
use tracing::trace;

use crate::coroutine::Thread;
use crate::dispatch::{Dispatcher, FuncReg, Frame, Outcome, debug_name};
use crate::error::{Error, ErrorCode, Result};
use crate::exec::{self, DEFAULT_CHUNK_NAME, Exec, RunOptions};
use crate::stack::{StackOps, live, push_lstring, raw_lstring};
use crate::state::{Shared, State, shared_for};
use crate::table::TableOps;
use crate::types::{CallbackId, CoStatus, OptLevel, Type};

/// Longest registration array scanned for its terminating entry.
pub const MAX_REGISTRATIONS: usize = 65_536;

pub type LBridgeCFunction = unsafe extern "C-unwind" fn(state: *mut LBridgeState) -> c_int;

pub type LBridgeExternalCallback =
    unsafe extern "C-unwind" fn(state: *mut LBridgeState, callback_id: u64) -> c_int;

/// Native function registration entry; arrays end with `{NULL, NULL}`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LBridgeReg {
    pub name: *const c_char,
    pub func: Option<LBridgeCFunction>,
}

/// External function registration entry; arrays end with `{NULL, 0}`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LBridgeExternalReg {
    pub name: *const c_char,
    pub callback_id: u64,
}

enum Handle {
    Root(State),
    Coroutine(Thread),
    Frame(Frame),
}

/// Opaque handle given to C callers.
pub struct LBridgeState {
    handle: Handle,
    error: RefCell<Option<CString>>,
}

impl LBridgeState {
    fn boxed(handle: Handle) -> *mut LBridgeState {
        Box::into_raw(Box::new(LBridgeState {
            handle,
            error: RefCell::new(None),
        }))
    }

    fn borrowed(frame: Frame) -> LBridgeState {
        LBridgeState {
            handle: Handle::Frame(frame),
            error: RefCell::new(None),
        }
    }

    fn ops(&self) -> &dyn StackOps {
        match &self.handle {
            Handle::Root(state) => state,
            Handle::Coroutine(thread) => thread,
            Handle::Frame(frame) => frame,
        }
    }

    fn shared(&self) -> Option<&Arc<Shared>> {
        match &self.handle {
            Handle::Root(state) => Some(state.shared()),
            Handle::Coroutine(thread) => Some(thread.shared()),
            Handle::Frame(frame) => frame.shared(),
        }
    }

    fn fail(&self, err: &Error) -> ErrorCode {
        self.ops().last_error_slot().set(err.message());
        err.code()
    }

    fn report(&self, result: Result<()>) -> ErrorCode {
        match result {
            Ok(()) => ErrorCode::Ok,
            Err(err) => self.fail(&err),
        }
    }
}

/// Root handles by state id, for [`lbridge_mainthread`].
static C_ROOTS: Lazy<DashMap<u64, usize>> = Lazy::new(DashMap::new);

/// Outstanding buffers returned by [`lbridge_compile`], address to length.
static BYTECODE_BUFFERS: Lazy<DashMap<usize, usize>> = Lazy::new(DashMap::new);

struct CDispatcher {
    callback: LBridgeExternalCallback,
}

impl Dispatcher for CDispatcher {
    fn dispatch(&self, frame: &Frame, id: CallbackId) -> Result<Outcome> {
        let mut handle = LBridgeState::borrowed(frame.reborrow());
        let count = unsafe { (self.callback)(&mut handle, id.0) };
        Ok(Outcome::from_raw(count))
    }

    // `lbridge_error` unwinds straight through the callback.
    fn catch_panics(&self) -> bool {
        false
    }
}

unsafe extern "C-unwind" fn c_function_trampoline(l: *mut ffi::lua_State) -> c_int {
    let raw = unsafe { ffi::lua_touserdata(l, ffi::lua_upvalueindex(1)) };
    if raw.is_null() {
        return 0;
    }
    let func = unsafe { std::mem::transmute::<*mut c_void, LBridgeCFunction>(raw) };
    let mut handle = LBridgeState::borrowed(Frame::new(l, unsafe { shared_for(l) }));
    unsafe { func(&mut handle) }
}

unsafe fn push_c_function(l: *mut ffi::lua_State, func: LBridgeCFunction, name: &str) {
    unsafe {
        ffi::lua_pushlightuserdata(l, func as *const () as *mut c_void);
        ffi::lua_pushcclosurek(l, c_function_trampoline, debug_name(name), 1, None);
    }
}

fn handle<'a>(state: *mut LBridgeState) -> Option<&'a LBridgeState> {
    unsafe { state.as_ref() }
}

fn ops<'a>(state: *mut LBridgeState) -> Option<&'a dyn StackOps> {
    handle(state).map(LBridgeState::ops)
}

fn read_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

/// `len == 0` means the text is NUL-terminated.
fn read_source<'a>(ptr: *const c_char, len: usize) -> &'a [u8] {
    if len == 0 {
        unsafe { CStr::from_ptr(ptr) }.to_bytes()
    } else {
        unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), len) }
    }
}

fn chunk_name(ptr: *const c_char) -> String {
    read_str(ptr).unwrap_or(DEFAULT_CHUNK_NAME).to_string()
}

/// Scans a sentinel-terminated array, validating every entry before anything
/// is installed.
fn collect_entries<'a, T, R>(
    first: *const T,
    name_of: impl Fn(&T) -> *const c_char,
    accept: impl Fn(&'a str, &T) -> Option<R>,
) -> Result<Vec<R>> {
    if first.is_null() {
        return Err(Error::invalid("registration array is NULL"));
    }
    let mut out = Vec::new();
    for offset in 0..MAX_REGISTRATIONS {
        let entry = unsafe { &*first.add(offset) };
        let name = name_of(entry);
        if name.is_null() {
            return Ok(out);
        }
        let Some(text) = read_str(name) else {
            return Err(Error::invalid(format!("entry {} has an invalid name", offset)));
        };
        match accept(text, entry) {
            Some(item) => out.push(item),
            None => return Err(Error::invalid(format!("entry {} ({}) is incomplete", offset, text))),
        }
    }
    Err(Error::invalid("registration array is not terminated"))
}

fn c_functions<'a>(funcs: *const LBridgeReg) -> Result<Vec<(&'a str, LBridgeCFunction)>> {
    collect_entries(funcs, |reg| reg.name, |name, reg| reg.func.map(|func| (name, func)))
}

fn external_entries<'a>(regs: *const LBridgeExternalReg) -> Result<Vec<FuncReg<'a>>> {
    collect_entries(
        regs,
        |reg| reg.name,
        |name, reg| Some(FuncReg::external(name, CallbackId(reg.callback_id))),
    )
}

fn install_c_functions(ops: &dyn StackOps, target: c_int, funcs: &[(&str, LBridgeCFunction)]) -> Result<()> {
    let Some(l) = live(ops) else {
        return Err(Error::invalid("state is closed"));
    };
    if funcs.iter().any(|(name, _)| name.contains('\0')) {
        return Err(Error::invalid("name contains NUL byte"));
    }
    let target = ops.abs_index(target);
    if !ops.check_stack(2) {
        return Err(Error::Memory("stack overflow during registration".to_string()));
    }
    for (name, func) in funcs {
        unsafe { push_c_function(l, *func, name) };
        ops.set_field(target, name)?;
    }
    Ok(())
}

fn type_cname(t: Type) -> &'static CStr {
    match t {
        Type::Nil => c"nil",
        Type::Boolean => c"boolean",
        Type::Number => c"number",
        Type::String => c"string",
        Type::Table => c"table",
        Type::Function => c"function",
        Type::Userdata => c"userdata",
        Type::Thread => c"thread",
        Type::Buffer => c"buffer",
        Type::Vector => c"vector",
    }
}

fn flag(b: bool) -> c_int {
    c_int::from(b)
}

// Lifecycle

/// Returns NULL when the VM cannot be allocated.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_new() -> *mut LBridgeState {
    let Ok(state) = State::new() else {
        return ptr::null_mut();
    };
    let id = state.id();
    let raw = LBridgeState::boxed(Handle::Root(state));
    C_ROOTS.insert(id, raw as usize);
    raw
}

/// Frees a root or coroutine handle. Closing a root invalidates its
/// coroutines; their handles must still be closed. Call-frame handles are
/// ignored.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_close(state: *mut LBridgeState) {
    let Some(h) = handle(state) else { return };
    match &h.handle {
        Handle::Frame(_) => return,
        Handle::Root(root) => {
            C_ROOTS.remove(&root.id());
        }
        Handle::Coroutine(_) => {}
    }
    drop(unsafe { Box::from_raw(state) });
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_openlibs(state: *mut LBridgeState) {
    let Some(l) = ops(state).and_then(live) else { return };
    unsafe { ffi::luaL_openlibs(l) };
}

// Execution

/// Compile and run `source`. `source_len == 0` means NUL-terminated, a NULL
/// chunk name means `"=chunk"`.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_dostring(
    state: *mut LBridgeState,
    source: *const c_char,
    source_len: usize,
    chunkname: *const c_char,
    opt_level: c_int,
) -> ErrorCode {
    let Some(h) = handle(state) else {
        return ErrorCode::InvalidArgument;
    };
    h.ops().clear_error();
    if source.is_null() {
        return h.fail(&Error::invalid("source is NULL"));
    }
    let Some(opt_level) = OptLevel::from_level(opt_level) else {
        return h.fail(&Error::invalid(format!("unknown optimization level {}", opt_level)));
    };
    let options = RunOptions::default()
        .chunk_name(chunk_name(chunkname))
        .opt_level(opt_level);
    h.report(h.ops().run_source(read_source(source, source_len), &options))
}

/// Compile to a buffer released with [`lbridge_freebytecode`].
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_compile(
    source: *const c_char,
    source_len: usize,
    opt_level: c_int,
    out_bytecode: *mut *mut c_char,
    out_len: *mut usize,
) -> ErrorCode {
    if source.is_null() || out_bytecode.is_null() || out_len.is_null() {
        return ErrorCode::InvalidArgument;
    }
    let Some(opt_level) = OptLevel::from_level(opt_level) else {
        return ErrorCode::InvalidArgument;
    };
    match exec::compile(read_source(source, source_len), opt_level) {
        Ok(bytecode) => {
            let len = bytecode.len();
            let raw = Box::into_raw(bytecode.into_boxed_slice()).cast::<u8>();
            BYTECODE_BUFFERS.insert(raw as usize, len);
            unsafe {
                *out_bytecode = raw.cast::<c_char>();
                *out_len = len;
            }
            ErrorCode::Ok
        }
        Err(err) => {
            trace!(error = %err, "compile failed");
            unsafe {
                *out_bytecode = ptr::null_mut();
                *out_len = 0;
            }
            err.code()
        }
    }
}

/// Releases a buffer from [`lbridge_compile`]; other pointers are ignored.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_freebytecode(bytecode: *mut c_char) {
    if bytecode.is_null() {
        return;
    }
    let Some((addr, len)) = BYTECODE_BUFFERS.remove(&(bytecode as usize)) else {
        return;
    };
    let slice = ptr::slice_from_raw_parts_mut(addr as *mut u8, len);
    drop(unsafe { Box::from_raw(slice) });
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_loadbytecode(
    state: *mut LBridgeState,
    bytecode: *const c_char,
    bytecode_len: usize,
    chunkname: *const c_char,
) -> ErrorCode {
    let Some(h) = handle(state) else {
        return ErrorCode::InvalidArgument;
    };
    if bytecode.is_null() {
        h.ops().clear_error();
        return h.fail(&Error::invalid("bytecode is NULL"));
    }
    let bytes = unsafe { std::slice::from_raw_parts(bytecode.cast::<u8>(), bytecode_len) };
    h.report(h.ops().load_bytecode(bytes, &chunk_name(chunkname)))
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_pcall(state: *mut LBridgeState, nargs: c_int, nresults: c_int) -> ErrorCode {
    let Some(h) = handle(state) else {
        return ErrorCode::InvalidArgument;
    };
    h.report(h.ops().pcall(nargs, nresults))
}

// Stack

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_gettop(state: *mut LBridgeState) -> c_int {
    ops(state).map_or(0, |s| s.top())
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_settop(state: *mut LBridgeState, idx: c_int) {
    if let Some(s) = ops(state) {
        s.set_top(idx);
    }
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_pop(state: *mut LBridgeState, n: c_int) {
    if let Some(s) = ops(state) {
        s.pop(n);
    }
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_pushvalue(state: *mut LBridgeState, idx: c_int) {
    if let Some(s) = ops(state) {
        s.push_value(idx);
    }
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_remove(state: *mut LBridgeState, idx: c_int) {
    if let Some(s) = ops(state) {
        s.remove(idx);
    }
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_insert(state: *mut LBridgeState, idx: c_int) {
    if let Some(s) = ops(state) {
        s.insert(idx);
    }
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_checkstack(state: *mut LBridgeState, extra: c_int) -> c_int {
    ops(state).map_or(0, |s| flag(s.check_stack(extra)))
}

// Types

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_type(state: *mut LBridgeState, idx: c_int) -> Type {
    ops(state).map_or(Type::Nil, |s| s.type_of(idx))
}

/// Static name of a type tag; works with a NULL handle.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_typename(_state: *mut LBridgeState, t: c_int) -> *const c_char {
    type_cname(Type::from(t)).as_ptr()
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_isnil(state: *mut LBridgeState, idx: c_int) -> c_int {
    ops(state).map_or(0, |s| flag(s.is_nil(idx)))
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_isboolean(state: *mut LBridgeState, idx: c_int) -> c_int {
    ops(state).map_or(0, |s| flag(s.is_boolean(idx)))
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_isnumber(state: *mut LBridgeState, idx: c_int) -> c_int {
    ops(state).map_or(0, |s| flag(s.is_number(idx)))
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_isstring(state: *mut LBridgeState, idx: c_int) -> c_int {
    ops(state).map_or(0, |s| flag(s.is_string(idx)))
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_istable(state: *mut LBridgeState, idx: c_int) -> c_int {
    ops(state).map_or(0, |s| flag(s.is_table(idx)))
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_isfunction(state: *mut LBridgeState, idx: c_int) -> c_int {
    ops(state).map_or(0, |s| flag(s.is_function(idx)))
}

// Push

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_pushnil(state: *mut LBridgeState) {
    if let Some(s) = ops(state) {
        s.push_nil();
    }
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_pushboolean(state: *mut LBridgeState, b: c_int) {
    if let Some(s) = ops(state) {
        s.push_boolean(b != 0);
    }
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_pushnumber(state: *mut LBridgeState, n: f64) {
    if let Some(s) = ops(state) {
        s.push_number(n);
    }
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_pushinteger(state: *mut LBridgeState, n: i64) {
    if let Some(s) = ops(state) {
        s.push_integer(n);
    }
}

/// Pushes nil for a NULL string.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_pushstring(state: *mut LBridgeState, s: *const c_char) {
    let Some(l) = ops(state).and_then(live) else { return };
    if s.is_null() {
        unsafe { ffi::lua_pushnil(l) };
        return;
    }
    unsafe { push_lstring(l, CStr::from_ptr(s).to_bytes()) };
}

/// Pushes `len` bytes, embedded zeros included. Pushes nil for NULL.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_pushlstring(state: *mut LBridgeState, s: *const c_char, len: usize) {
    let Some(l) = ops(state).and_then(live) else { return };
    if s.is_null() {
        unsafe { ffi::lua_pushnil(l) };
        return;
    }
    unsafe { push_lstring(l, std::slice::from_raw_parts(s.cast::<u8>(), len)) };
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_pushcfunction(
    state: *mut LBridgeState,
    func: Option<LBridgeCFunction>,
    debugname: *const c_char,
) {
    let (Some(l), Some(func)) = (ops(state).and_then(live), func) else {
        return;
    };
    unsafe { push_c_function(l, func, read_str(debugname).unwrap_or_default()) };
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_pushexternalfunc(
    state: *mut LBridgeState,
    callback_id: u64,
    debugname: *const c_char,
) {
    if let Some(s) = ops(state) {
        s.push_external(CallbackId(callback_id), read_str(debugname).unwrap_or_default());
    }
}

// Read

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_toboolean(state: *mut LBridgeState, idx: c_int) -> c_int {
    ops(state).map_or(0, |s| flag(s.to_boolean(idx)))
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_tonumber(state: *mut LBridgeState, idx: c_int) -> f64 {
    ops(state).map_or(0.0, |s| s.to_number(idx))
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_tointeger(state: *mut LBridgeState, idx: c_int) -> i64 {
    ops(state).map_or(0, |s| s.to_integer(idx))
}

/// Pointer into the VM, valid while the value stays on the stack.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_tostring(state: *mut LBridgeState, idx: c_int) -> *const c_char {
    lbridge_tolstring(state, idx, ptr::null_mut())
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_tolstring(state: *mut LBridgeState, idx: c_int, len: *mut usize) -> *const c_char {
    let (data, size) = match ops(state).and_then(live) {
        Some(l) => unsafe { raw_lstring(l, idx) },
        None => (ptr::null(), 0),
    };
    if !len.is_null() {
        unsafe { *len = size };
    }
    data
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_strlen(state: *mut LBridgeState, idx: c_int) -> usize {
    ops(state).map_or(0, |s| s.string_len(idx))
}

// Tables

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_newtable(state: *mut LBridgeState) {
    if let Some(s) = ops(state) {
        s.new_table();
    }
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_createtable(state: *mut LBridgeState, narr: c_int, nrec: c_int) {
    if let Some(s) = ops(state) {
        s.create_table(narr, nrec);
    }
}

/// Pushes `t[key]`; pushes nil when `key` is NULL. A guest error raised by a
/// metamethod also leaves nil and is kept for [`lbridge_geterror`].
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_getfield(state: *mut LBridgeState, idx: c_int, key: *const c_char) -> Type {
    let Some(s) = ops(state) else { return Type::Nil };
    match read_str(key) {
        Some(key) => s.get_field(idx, key).unwrap_or(Type::Nil),
        None => {
            s.push_nil();
            Type::Nil
        }
    }
}

/// Pops a value into `t[key]`. Guest errors come back as `RuntimeError`.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_setfield(state: *mut LBridgeState, idx: c_int, key: *const c_char) -> ErrorCode {
    let Some(h) = handle(state) else {
        return ErrorCode::InvalidArgument;
    };
    let Some(key) = read_str(key) else {
        h.ops().pop(1);
        return h.fail(&Error::invalid("field name is NULL or not UTF-8"));
    };
    h.report(h.ops().set_field(idx, key))
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_gettable(state: *mut LBridgeState, idx: c_int) -> Type {
    ops(state).map_or(Type::Nil, |s| s.get_table(idx).unwrap_or(Type::Nil))
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_settable(state: *mut LBridgeState, idx: c_int) -> ErrorCode {
    let Some(h) = handle(state) else {
        return ErrorCode::InvalidArgument;
    };
    h.report(h.ops().set_table(idx))
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_rawget(state: *mut LBridgeState, idx: c_int) -> Type {
    ops(state).map_or(Type::Nil, |s| s.raw_get(idx))
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_rawset(state: *mut LBridgeState, idx: c_int) -> ErrorCode {
    let Some(h) = handle(state) else {
        return ErrorCode::InvalidArgument;
    };
    h.report(h.ops().raw_set(idx))
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_rawgeti(state: *mut LBridgeState, idx: c_int, n: i64) -> Type {
    ops(state).map_or(Type::Nil, |s| s.raw_get_index(idx, n))
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_rawseti(state: *mut LBridgeState, idx: c_int, n: i64) -> ErrorCode {
    let Some(h) = handle(state) else {
        return ErrorCode::InvalidArgument;
    };
    h.report(h.ops().raw_set_index(idx, n))
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_objlen(state: *mut LBridgeState, idx: c_int) -> usize {
    ops(state).map_or(0, |s| s.obj_len(idx))
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_next(state: *mut LBridgeState, idx: c_int) -> c_int {
    ops(state).map_or(0, |s| flag(s.next(idx)))
}

// Globals

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_getglobal(state: *mut LBridgeState, name: *const c_char) -> Type {
    lbridge_getfield(state, ffi::LUA_GLOBALSINDEX, name)
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_setglobal(state: *mut LBridgeState, name: *const c_char) -> ErrorCode {
    lbridge_setfield(state, ffi::LUA_GLOBALSINDEX, name)
}

// Registration

/// Binds every entry of a `{NULL, NULL}`-terminated array as a global.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_register(state: *mut LBridgeState, funcs: *const LBridgeReg) -> ErrorCode {
    let Some(h) = handle(state) else {
        return ErrorCode::InvalidArgument;
    };
    h.ops().clear_error();
    let result = c_functions(funcs).and_then(|entries| install_c_functions(h.ops(), ffi::LUA_GLOBALSINDEX, &entries));
    h.report(result)
}

/// Stores every entry as a field of the table on top of the stack.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_setfuncs(state: *mut LBridgeState, funcs: *const LBridgeReg) -> ErrorCode {
    let Some(h) = handle(state) else {
        return ErrorCode::InvalidArgument;
    };
    h.ops().clear_error();
    let s = h.ops();
    if !s.is_table(-1) {
        return h.fail(&Error::invalid("no table on top of the stack"));
    }
    let target = s.abs_index(-1);
    let result = c_functions(funcs).and_then(|entries| install_c_functions(s, target, &entries));
    h.report(result)
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_registerexternal(
    state: *mut LBridgeState,
    name: *const c_char,
    callback_id: u64,
) -> ErrorCode {
    let Some(h) = handle(state) else {
        return ErrorCode::InvalidArgument;
    };
    h.ops().clear_error();
    let Some(name) = read_str(name) else {
        return h.fail(&Error::invalid("name is NULL or not UTF-8"));
    };
    h.report(h.ops().register_external(name, CallbackId(callback_id)))
}

/// Binds every entry of a `{NULL, 0}`-terminated array as a global.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_registerexternals(
    state: *mut LBridgeState,
    regs: *const LBridgeExternalReg,
) -> ErrorCode {
    let Some(h) = handle(state) else {
        return ErrorCode::InvalidArgument;
    };
    h.ops().clear_error();
    let result = external_entries(regs).and_then(|entries| h.ops().register(&entries));
    h.report(result)
}

/// Stores every external entry as a field of the table on top of the stack.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_setexternals(
    state: *mut LBridgeState,
    regs: *const LBridgeExternalReg,
) -> ErrorCode {
    let Some(h) = handle(state) else {
        return ErrorCode::InvalidArgument;
    };
    h.ops().clear_error();
    if !h.ops().is_table(-1) {
        return h.fail(&Error::invalid("no table on top of the stack"));
    }
    let result = external_entries(regs).and_then(|entries| h.ops().set_funcs(-1, &entries));
    h.report(result)
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_unregister(state: *mut LBridgeState, name: *const c_char) {
    let (Some(s), Some(name)) = (ops(state), read_str(name)) else {
        return;
    };
    let _ = s.unregister(name);
}

// Callbacks

/// Installs (or with NULL removes) the dispatcher for the whole root state.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_setexternalcallback(
    state: *mut LBridgeState,
    callback: Option<LBridgeExternalCallback>,
) {
    let Some(shared) = handle(state).and_then(LBridgeState::shared) else {
        return;
    };
    if !shared.is_open() {
        return;
    }
    let dispatcher = callback.map(|callback| Arc::new(CDispatcher { callback }) as Arc<dyn Dispatcher>);
    shared.replace_dispatcher(dispatcher);
}

/// Identifier of the external function being dispatched, 0 outside one.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_getcallbackid(state: *mut LBridgeState) -> u64 {
    handle(state)
        .and_then(LBridgeState::shared)
        .and_then(|shared| shared.current_callback())
        .map_or(0, |id| id.0)
}

// Errors

/// Last error message or NULL. Valid until the next call on this handle.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_geterror(state: *mut LBridgeState) -> *const c_char {
    let Some(h) = handle(state) else {
        return ptr::null();
    };
    let mut cache = h.error.borrow_mut();
    *cache = h
        .ops()
        .last_error()
        .map(|message| CString::new(message.replace('\0', "\\0")).unwrap_or_default());
    cache.as_ref().map_or(ptr::null(), |message| message.as_ptr())
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_clearerror(state: *mut LBridgeState) {
    if let Some(h) = handle(state) {
        h.ops().clear_error();
        h.error.borrow_mut().take();
    }
}

/// Raises a guest error and does not return. Outside a protected call the
/// VM treats this as fatal.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_error(state: *mut LBridgeState, msg: *const c_char) {
    let Some(h) = handle(state) else { return };
    let Some(l) = live(h.ops()) else { return };
    let message = if msg.is_null() {
        b"error".as_slice()
    } else {
        unsafe { CStr::from_ptr(msg) }.to_bytes()
    };
    h.ops().last_error_slot().set(String::from_utf8_lossy(message));
    unsafe {
        push_lstring(l, message);
        ffi::lua_error(l);
    }
}

// Memory

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_memoryusage(state: *mut LBridgeState) -> usize {
    ops(state).map_or(0, |s| s.memory_usage())
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_gc(state: *mut LBridgeState) {
    if let Some(s) = ops(state) {
        s.collect_garbage();
    }
}

// Coroutines

/// New coroutine handle sharing `state`'s heap, or NULL.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_newthread(state: *mut LBridgeState) -> *mut LBridgeState {
    let Some(h) = handle(state) else {
        return ptr::null_mut();
    };
    let (Some(l), Some(shared)) = (live(h.ops()), h.shared()) else {
        return ptr::null_mut();
    };
    match unsafe { Thread::spawn(l, Arc::clone(shared)) } {
        Ok(thread) => LBridgeState::boxed(Handle::Coroutine(thread)),
        Err(err) => {
            h.fail(&err);
            ptr::null_mut()
        }
    }
}

/// Resumes a coroutine handle with `nargs` values pushed on its stack.
/// `from` may be NULL.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_resume(
    co: *mut LBridgeState,
    from: *mut LBridgeState,
    nargs: c_int,
    nresults: *mut c_int,
) -> CoStatus {
    let Some(h) = handle(co) else {
        return CoStatus::ErrRun;
    };
    let Handle::Coroutine(thread) = &h.handle else {
        h.ops().last_error_slot().set("handle is not a coroutine");
        return CoStatus::ErrRun;
    };
    let outcome = match ops(from) {
        Some(from) => thread.resume_from(from, nargs),
        None => thread.resume(nargs),
    };
    if !nresults.is_null() {
        unsafe { *nresults = outcome.nresults };
    }
    outcome.status
}

/// Use as `return lbridge_yield(L, n);` from a native or external function.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_yield(state: *mut LBridgeState, nresults: c_int) -> c_int {
    let Some(h) = handle(state) else { return 0 };
    let Some(l) = live(h.ops()) else { return 0 };
    if !h.ops().is_yieldable() {
        let message = "attempt to yield from outside a coroutine";
        h.ops().last_error_slot().set(message);
        unsafe {
            push_lstring(l, message.as_bytes());
            ffi::lua_error(l);
        }
    }
    unsafe { ffi::lua_yield(l, nresults.clamp(0, ffi::lua_gettop(l))) }
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_status(state: *mut LBridgeState) -> CoStatus {
    let Some(h) = handle(state) else {
        return CoStatus::ErrRun;
    };
    match &h.handle {
        Handle::Coroutine(thread) => thread.status(),
        _ => match live(h.ops()) {
            Some(l) => CoStatus::from_vm(unsafe { ffi::lua_status(l) }),
            None => CoStatus::ErrRun,
        },
    }
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_isyieldable(state: *mut LBridgeState) -> c_int {
    ops(state).map_or(0, |s| flag(s.is_yieldable()))
}

/// Root handle owning `state`'s heap, NULL for closed or foreign states.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_mainthread(state: *mut LBridgeState) -> *mut LBridgeState {
    let Some(shared) = handle(state).and_then(LBridgeState::shared) else {
        return ptr::null_mut();
    };
    C_ROOTS
        .get(&shared.id())
        .map_or(ptr::null_mut(), |root| *root.value() as *mut LBridgeState)
}

/// Moves `n` values from `from`'s stack to `to`'s stack (same heap).
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_xmove(from: *mut LBridgeState, to: *mut LBridgeState, n: c_int) {
    let (Some(from), Some(to)) = (ops(from), ops(to)) else {
        return;
    };
    from.xmove_to(to, n);
}

// Debug

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_version() -> *const c_char {
    crate::VERSION_NUL.as_ptr().cast::<c_char>()
}

/// Newly allocated dump, released with [`lbridge_freestring`].
#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_dumpstack(state: *mut LBridgeState) -> *mut c_char {
    let dump = ops(state).map(|s| s.dump_stack()).unwrap_or_default();
    CString::new(dump).unwrap_or_default().into_raw()
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn lbridge_freestring(s: *mut c_char) {
    if !s.is_null() {
        drop(unsafe { CString::from_raw(s) });
    }
}
