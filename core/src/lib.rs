//! Embedding bridge for the Luau VM.
//!
//! [`State`] owns one VM; [`Thread`] is a coroutine view on its heap and
//! [`Frame`] is the stack seen by a native function while it runs. All three
//! share the null-safe stack API in [`StackOps`], [`TableOps`] and [`Exec`].
//! The flat C surface lives in [`capi`].

pub mod capi;
mod coroutine;
mod dispatch;
mod error;
mod exec;
mod stack;
mod state;
mod table;
mod types;

pub use coroutine::{Resume, Thread};
pub use dispatch::{
    Dispatcher, FnDispatcher, Frame, FuncReg, FunctionTable, HostFn, NativeFn, Outcome, Registration,
};
pub use error::{Error, ErrorCode, LastError, Result};
pub use exec::{DEFAULT_CHUNK_NAME, Exec, RunOptions, compile};
pub use stack::StackOps;
pub use state::State;
pub use table::TableOps;
pub use types::{CallbackId, CoStatus, OptLevel, Type};

/// Pass as `nresults` to keep every result of a call.
pub const MULTRET: i32 = mlua_sys::LUA_MULTRET;

pub(crate) const VERSION_NUL: &str = concat!("luau-bridge ", env!("CARGO_PKG_VERSION"), "\0");

/// Bridge name and version, e.g. `luau-bridge 0.1.0`.
pub fn version() -> &'static str {
    VERSION_NUL.trim_end_matches('\0')
}

pub mod prelude {
    pub use crate::{
        CallbackId, CoStatus, Error, Exec, Frame, FuncReg, FunctionTable, OptLevel, Outcome, Result, RunOptions,
        StackOps, State, TableOps, Thread, Type,
    };
}

#[cfg(test)]
mod capi_test;
#[cfg(test)]
mod dispatch_test;
#[cfg(test)]
mod exec_test;
#[cfg(test)]
mod state_test;
