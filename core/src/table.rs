//! Table, global and registration operations layered over [`StackOps`].

use std::ffi::{CString, c_int};
use std::ptr;

use mlua_sys as ffi;

use crate::dispatch::{FuncReg, push_external, push_registration};
use crate::error::{Error, Result};
use crate::exec::protected_call;
use crate::stack::{StackOps, live};
use crate::types::{CallbackId, Type};

fn field_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| Error::invalid(format!("name contains NUL byte: {:?}", name)))
}

/// Validates every name of a batch up front so a bad entry installs nothing.
fn registration_names(regs: &[FuncReg<'_>]) -> Result<Vec<CString>> {
    regs.iter().map(|reg| field_name(reg.name)).collect()
}

fn closed() -> Error {
    Error::invalid("state is closed")
}

fn record<S: StackOps + ?Sized, T>(s: &S, result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        s.last_error_slot().set(err.message());
    }
    result
}

unsafe extern "C-unwind" fn index_helper(l: *mut ffi::lua_State) -> c_int {
    unsafe { ffi::lua_gettable(l, 1) };
    1
}

unsafe extern "C-unwind" fn newindex_helper(l: *mut ffi::lua_State) -> c_int {
    unsafe { ffi::lua_settable(l, 1) };
    0
}

unsafe extern "C-unwind" fn rawset_helper(l: *mut ffi::lua_State) -> c_int {
    unsafe { ffi::lua_rawset(l, 1) };
    0
}

/// A table without a metatable; indexing it never runs guest code.
unsafe fn is_plain_table(l: *mut ffi::lua_State, t: c_int) -> bool {
    unsafe {
        if ffi::lua_type(l, t) != ffi::LUA_TTABLE {
            return false;
        }
        if ffi::lua_getmetatable(l, t) != 0 {
            ffi::lua_settop(l, -2);
            return false;
        }
        true
    }
}

/// Whether a raw store of the key/value pair on top into `t` cannot raise.
unsafe fn is_safe_store(l: *mut ffi::lua_State, t: c_int) -> bool {
    unsafe {
        if ffi::lua_type(l, t) != ffi::LUA_TTABLE || ffi::lua_getreadonly(l, t) != 0 {
            return false;
        }
        match ffi::lua_type(l, -2) {
            ffi::LUA_TNIL => false,
            ffi::LUA_TNUMBER => !ffi::lua_tonumberx(l, -2, ptr::null_mut()).is_nan(),
            _ => true,
        }
    }
}

/// Pops the key on top and pushes `t[key]` for the table at absolute index
/// `t`. Metamethods run under a protected call; on error nil takes the
/// value's place.
unsafe fn index_protected(l: *mut ffi::lua_State, t: c_int) -> Result<Type> {
    unsafe {
        if is_plain_table(l, t) {
            return Ok(Type::from_vm(ffi::lua_rawget(l, t)));
        }
        if ffi::lua_checkstack(l, 2) == 0 {
            ffi::lua_settop(l, -2);
            ffi::lua_pushnil(l);
            return Err(Error::Memory("stack overflow while indexing".to_string()));
        }
        // [key] -> [helper, t, key]
        ffi::lua_pushcfunction(l, index_helper);
        ffi::lua_insert(l, -2);
        ffi::lua_pushvalue(l, t);
        ffi::lua_insert(l, -2);
        if let Err(err) = protected_call(l, 2, 1) {
            ffi::lua_pushnil(l);
            return Err(err);
        }
        Ok(Type::from_vm(ffi::lua_type(l, -1)))
    }
}

/// Pops a key and a value (value on top) and stores `t[key] = value` for the
/// table at absolute index `t`. With `raw` set metamethods are skipped, but
/// errors such as a nil key or a frozen table are still caught.
unsafe fn store_protected(l: *mut ffi::lua_State, t: c_int, raw: bool) -> Result<()> {
    unsafe {
        if raw && ffi::lua_type(l, t) != ffi::LUA_TTABLE {
            ffi::lua_settop(l, -3);
            return Err(Error::invalid("raw store into a non-table value"));
        }
        if is_safe_store(l, t) && (raw || is_plain_table(l, t)) {
            ffi::lua_rawset(l, t);
            return Ok(());
        }
        if ffi::lua_checkstack(l, 2) == 0 {
            ffi::lua_settop(l, -3);
            return Err(Error::Memory("stack overflow while storing".to_string()));
        }
        // [key, value] -> [helper, t, key, value]
        let helper: ffi::lua_CFunction = if raw { rawset_helper } else { newindex_helper };
        ffi::lua_pushcfunction(l, helper);
        ffi::lua_insert(l, -3);
        ffi::lua_pushvalue(l, t);
        ffi::lua_insert(l, -3);
        protected_call(l, 3, 0)
    }
}

/// Absolute index of `idx`, after checking that it is a valid slot.
unsafe fn table_slot(l: *mut ffi::lua_State, idx: c_int) -> Result<c_int> {
    unsafe {
        if ffi::lua_type(l, idx) == ffi::LUA_TNONE {
            return Err(Error::invalid(format!("no value at index {}", idx)));
        }
        Ok(ffi::lua_absindex(l, idx))
    }
}

pub trait TableOps: StackOps {
    /// Push a new empty table.
    fn new_table(&self) {
        self.create_table(0, 0);
    }

    /// Push a new table with preallocated array and hash parts.
    fn create_table(&self, narr: i32, nrec: i32) {
        let Some(l) = live(self) else { return };
        unsafe { ffi::lua_createtable(l, narr.max(0), nrec.max(0)) };
    }

    /// Push `t[key]` for the table at `idx`; metamethods apply. A guest error
    /// raised by a metamethod comes back as `Error::Runtime` with nil pushed.
    fn get_field(&self, idx: i32, key: &str) -> Result<Type> {
        let Some(l) = live(self) else { return Err(closed()) };
        let key = field_name(key)?;
        let result = unsafe {
            table_slot(l, idx).and_then(|t| {
                ffi::lua_pushstring(l, key.as_ptr());
                index_protected(l, t)
            })
        };
        record(self, result)
    }

    /// Pop a value and store it as `t[key]` for the table at `idx`.
    fn set_field(&self, idx: i32, key: &str) -> Result<()> {
        let Some(l) = live(self) else { return Err(closed()) };
        let key = field_name(key)?;
        let result = unsafe {
            table_slot(l, idx).and_then(|t| {
                ffi::lua_pushstring(l, key.as_ptr());
                ffi::lua_insert(l, -2);
                store_protected(l, t, false)
            })
        };
        record(self, result)
    }

    /// Pop a key and push `t[key]`; metamethods apply.
    fn get_table(&self, idx: i32) -> Result<Type> {
        let Some(l) = live(self) else { return Err(closed()) };
        let result = unsafe { table_slot(l, idx).and_then(|t| index_protected(l, t)) };
        record(self, result)
    }

    /// Pop a key and a value (value on top) and store `t[key] = value`.
    fn set_table(&self, idx: i32) -> Result<()> {
        let Some(l) = live(self) else { return Err(closed()) };
        let result = unsafe { table_slot(l, idx).and_then(|t| store_protected(l, t, false)) };
        record(self, result)
    }

    /// [`TableOps::get_table`] without metamethods; nil for non-tables.
    fn raw_get(&self, idx: i32) -> Type {
        let Some(l) = live(self) else { return Type::Nil };
        unsafe {
            if ffi::lua_type(l, idx) != ffi::LUA_TTABLE {
                ffi::lua_settop(l, -2);
                ffi::lua_pushnil(l);
                return Type::Nil;
            }
            Type::from_vm(ffi::lua_rawget(l, idx))
        }
    }

    /// [`TableOps::set_table`] without metamethods. A nil or NaN key and a
    /// frozen table are reported as errors.
    fn raw_set(&self, idx: i32) -> Result<()> {
        let Some(l) = live(self) else { return Err(closed()) };
        let result = unsafe { table_slot(l, idx).and_then(|t| store_protected(l, t, true)) };
        record(self, result)
    }

    /// Push `t[n]` without metamethods.
    fn raw_get_index(&self, idx: i32, n: i64) -> Type {
        let Some(l) = live(self) else { return Type::Nil };
        unsafe {
            let t = ffi::lua_absindex(l, idx);
            ffi::lua_pushnumber(l, n as f64);
            self.raw_get(t)
        }
    }

    /// Pop a value and store it as `t[n]` without metamethods.
    fn raw_set_index(&self, idx: i32, n: i64) -> Result<()> {
        let Some(l) = live(self) else { return Err(closed()) };
        let result = unsafe {
            table_slot(l, idx).and_then(|t| {
                ffi::lua_pushnumber(l, n as f64);
                ffi::lua_insert(l, -2);
                store_protected(l, t, true)
            })
        };
        record(self, result)
    }

    /// Length of a table, string or buffer; 0 for other types.
    fn obj_len(&self, idx: i32) -> usize {
        let Some(l) = live(self) else { return 0 };
        unsafe { ffi::lua_objlen(l, idx) as usize }
    }

    /// Table traversal step: pops a key, pushes the next key/value pair and
    /// returns true, or returns false with nothing pushed at the end.
    fn next(&self, idx: i32) -> bool {
        let Some(l) = live(self) else { return false };
        unsafe {
            if ffi::lua_type(l, idx) != ffi::LUA_TTABLE {
                ffi::lua_settop(l, -2);
                return false;
            }
            ffi::lua_next(l, idx) != 0
        }
    }

    // Globals

    fn get_global(&self, name: &str) -> Result<Type> {
        self.get_field(ffi::LUA_GLOBALSINDEX, name)
    }

    /// Pop a value and bind it to the global `name`.
    fn set_global(&self, name: &str) -> Result<()> {
        self.set_field(ffi::LUA_GLOBALSINDEX, name)
    }

    /// Set the global `name` to nil. Used to sandbox standard libraries.
    fn remove_global(&self, name: &str) -> Result<()> {
        let Some(l) = live(self) else { return Err(closed()) };
        field_name(name)?;
        unsafe { ffi::lua_pushnil(l) };
        self.set_field(ffi::LUA_GLOBALSINDEX, name)
    }

    // Registration

    /// Bind every entry as a global function. Names are validated first; on
    /// failure nothing is installed.
    fn register(&self, regs: &[FuncReg<'_>]) -> Result<()> {
        self.set_funcs(ffi::LUA_GLOBALSINDEX, regs)
    }

    /// Store every entry as a field of the table at `idx`.
    fn set_funcs(&self, idx: i32, regs: &[FuncReg<'_>]) -> Result<()> {
        let Some(l) = live(self) else { return Err(closed()) };
        let names = registration_names(regs)?;
        let result = unsafe {
            table_slot(l, idx).and_then(|target| {
                if ffi::lua_checkstack(l, 4) == 0 {
                    return Err(Error::Memory("stack overflow during registration".to_string()));
                }
                for (reg, name) in regs.iter().zip(&names) {
                    ffi::lua_pushstring(l, name.as_ptr());
                    push_registration(l, reg);
                    store_protected(l, target, false)?;
                }
                Ok(())
            })
        };
        record(self, result)
    }

    /// Bind a single external function as the global `name`.
    fn register_external(&self, name: &str, id: CallbackId) -> Result<()> {
        let Some(l) = live(self) else { return Err(closed()) };
        field_name(name)?;
        unsafe { push_external(l, id, name) };
        self.set_field(ffi::LUA_GLOBALSINDEX, name)
    }

    /// Remove a global function binding.
    fn unregister(&self, name: &str) -> Result<()> {
        self.remove_global(name)
    }
}

impl<T: StackOps + ?Sized> TableOps for T {}
