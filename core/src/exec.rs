//! Compile, load and protected-call pipeline.

use std::ffi::{CString, c_char, c_int};

use mlua_sys as ffi;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::stack::{StackOps, live, pop_error_message};
use crate::state::shared_for;
use crate::types::OptLevel;

pub const DEFAULT_CHUNK_NAME: &str = "=chunk";

/// Options for [`Exec::run_source`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub chunk_name: String,
    pub opt_level: OptLevel,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            chunk_name: DEFAULT_CHUNK_NAME.to_string(),
            opt_level: OptLevel::default(),
        }
    }
}

impl RunOptions {
    pub fn chunk_name(mut self, name: impl Into<String>) -> Self {
        self.chunk_name = name.into();
        self
    }

    pub fn opt_level(mut self, level: OptLevel) -> Self {
        self.opt_level = level;
        self
    }
}

/// Compile source text to bytecode.
///
/// The compiler reports failure in-band: the returned buffer then starts with
/// a zero byte followed by the message.
pub fn compile(source: &[u8], opt_level: OptLevel) -> Result<Vec<u8>> {
    let mut options = ffi::lua_CompileOptions::default();
    options.optimizationLevel = opt_level as c_int;
    let bytecode = unsafe { ffi::luau_compile(source, options) };
    match bytecode.first() {
        None => Err(Error::Compile("Compilation failed".to_string())),
        Some(0) => {
            let message = String::from_utf8_lossy(&bytecode[1..]).trim_end().to_string();
            if message.is_empty() {
                Err(Error::Compile("Compilation failed".to_string()))
            } else {
                Err(Error::Compile(message))
            }
        }
        Some(_) => {
            trace!(bytes = bytecode.len(), ?opt_level, "compiled chunk");
            Ok(bytecode)
        }
    }
}

fn chunk_cname(chunk_name: &str) -> Result<CString> {
    let name = if chunk_name.is_empty() { DEFAULT_CHUNK_NAME } else { chunk_name };
    CString::new(name).map_err(|_| Error::invalid("chunk name contains NUL byte"))
}

/// Execution operations. Each one clears the wrapper's last error first and
/// records the message on failure.
pub trait Exec: StackOps {
    /// Push the function built from `bytecode`.
    fn load_bytecode(&self, bytecode: &[u8], chunk_name: &str) -> Result<()> {
        self.clear_error();
        let result = load_into(self, bytecode, chunk_name);
        record(self, result)
    }

    /// Call the function below `nargs` arguments; keeps `nresults` results
    /// (`ffi::LUA_MULTRET` for all). Guest errors never escape this call.
    fn pcall(&self, nargs: i32, nresults: i32) -> Result<()> {
        self.clear_error();
        let result = pcall_in(self, nargs, nresults);
        record(self, result)
    }

    /// Compile, load and run a chunk. Results stay on the stack.
    fn run_source(&self, source: &[u8], options: &RunOptions) -> Result<()> {
        self.clear_error();
        let result = compile(source, options.opt_level)
            .and_then(|bytecode| load_into(self, &bytecode, &options.chunk_name))
            .and_then(|()| pcall_in(self, 0, ffi::LUA_MULTRET));
        if let Err(err) = &result {
            debug!(chunk = %options.chunk_name, error = %err, "chunk failed");
        }
        record(self, result)
    }

    /// [`Exec::run_source`] with default options.
    fn run(&self, source: &str) -> Result<()> {
        self.run_source(source.as_bytes(), &RunOptions::default())
    }
}

impl<T: StackOps + ?Sized> Exec for T {}

fn record<S: StackOps + ?Sized>(s: &S, result: Result<()>) -> Result<()> {
    if let Err(err) = &result {
        s.last_error_slot().set(err.message());
    }
    result
}

fn load_into<S: StackOps + ?Sized>(s: &S, bytecode: &[u8], chunk_name: &str) -> Result<()> {
    let Some(l) = live(s) else {
        return Err(Error::invalid("state is closed"));
    };
    if bytecode.is_empty() {
        return Err(Error::invalid("empty bytecode"));
    }
    let name = chunk_cname(chunk_name)?;
    let code = unsafe {
        ffi::luau_load(l, name.as_ptr(), bytecode.as_ptr().cast::<c_char>(), bytecode.len(), 0)
    };
    if code != 0 {
        let message = unsafe { pop_error_message(l, "Failed to load bytecode") };
        return Err(Error::Load(message));
    }
    Ok(())
}

fn pcall_in<S: StackOps + ?Sized>(s: &S, nargs: i32, nresults: i32) -> Result<()> {
    let Some(l) = live(s) else {
        return Err(Error::invalid("state is closed"));
    };
    let nargs = nargs.max(0);
    if unsafe { ffi::lua_gettop(l) } < nargs + 1 {
        return Err(Error::invalid("nothing to call"));
    }
    unsafe { protected_call(l, nargs, nresults) }
}

/// Call the function below the top `nargs` values, catching guest errors.
/// On failure the error value is popped and returned as `Error::Runtime`.
///
/// # Safety
/// `l` must be a live VM handle holding the function and its arguments.
pub(crate) unsafe fn protected_call(l: *mut ffi::lua_State, nargs: c_int, nresults: c_int) -> Result<()> {
    // Only a running or fresh coroutine accepts calls.
    if unsafe { ffi::lua_status(l) } != ffi::LUA_OK {
        unsafe { ffi::lua_settop(l, -nargs - 2) };
        return Err(Error::runtime("cannot call into a suspended or faulted coroutine"));
    }
    // A guest error raised inside a host function can skip its scope guard,
    // so the callback slot is restored here as well.
    let shared = unsafe { shared_for(l) };
    let slot = shared.as_ref().map(|shared| shared.callback_slot());
    let code = unsafe { ffi::lua_pcall(l, nargs, nresults, 0) };
    if let (Some(shared), Some(slot)) = (&shared, slot) {
        shared.leave_callback(slot);
    }
    // Every failure status, memory included, surfaces as a runtime error.
    if code != ffi::LUA_OK {
        return Err(Error::Runtime(unsafe { pop_error_message(l, "Runtime error") }));
    }
    Ok(())
}
