use std::ffi::c_int;
use std::fmt;

use mlua_sys as ffi;

/// Status of a coroutine suspended at a debug breakpoint; not exported by
/// the bindings.
const LUA_BREAK: c_int = 6;

/// Value type tag reported for a stack slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Nil = 0,
    Boolean = 1,
    Number = 2,
    String = 3,
    Table = 4,
    Function = 5,
    Userdata = 6,
    Thread = 7,
    Buffer = 8,
    Vector = 9,
}

impl Type {
    /// Maps the VM's own type constant. Out-of-range slots (`LUA_TNONE`)
    /// report `Nil`.
    pub(crate) fn from_vm(tag: c_int) -> Type {
        match tag {
            ffi::LUA_TBOOLEAN => Type::Boolean,
            ffi::LUA_TNUMBER => Type::Number,
            ffi::LUA_TSTRING => Type::String,
            ffi::LUA_TTABLE => Type::Table,
            ffi::LUA_TFUNCTION => Type::Function,
            ffi::LUA_TUSERDATA | ffi::LUA_TLIGHTUSERDATA => Type::Userdata,
            ffi::LUA_TTHREAD => Type::Thread,
            ffi::LUA_TBUFFER => Type::Buffer,
            ffi::LUA_TVECTOR => Type::Vector,
            _ => Type::Nil,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Type::Nil => "nil",
            Type::Boolean => "boolean",
            Type::Number => "number",
            Type::String => "string",
            Type::Table => "table",
            Type::Function => "function",
            Type::Userdata => "userdata",
            Type::Thread => "thread",
            Type::Buffer => "buffer",
            Type::Vector => "vector",
        }
    }
}

impl From<i32> for Type {
    fn from(value: i32) -> Self {
        match value {
            1 => Type::Boolean,
            2 => Type::Number,
            3 => Type::String,
            4 => Type::Table,
            5 => Type::Function,
            6 => Type::Userdata,
            7 => Type::Thread,
            8 => Type::Buffer,
            9 => Type::Vector,
            _ => Type::Nil,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compiler optimization level, forwarded verbatim to the Luau compiler.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OptLevel {
    None = 0,
    O1 = 1,
    #[default]
    O2 = 2,
}

impl OptLevel {
    pub fn from_level(level: i32) -> Option<OptLevel> {
        match level {
            0 => Some(OptLevel::None),
            1 => Some(OptLevel::O1),
            2 => Some(OptLevel::O2),
            _ => None,
        }
    }
}

/// Host-visible run status of a coroutine.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CoStatus {
    /// Created, or finished cleanly.
    #[default]
    Ok = 0,
    Yield = 1,
    ErrRun = 2,
    ErrSyntax = 3,
    ErrMem = 4,
    ErrErr = 5,
    Break = 6,
}

impl CoStatus {
    pub(crate) fn from_vm(code: c_int) -> CoStatus {
        match code {
            ffi::LUA_OK => CoStatus::Ok,
            ffi::LUA_YIELD => CoStatus::Yield,
            ffi::LUA_ERRSYNTAX => CoStatus::ErrSyntax,
            ffi::LUA_ERRMEM => CoStatus::ErrMem,
            ffi::LUA_ERRERR => CoStatus::ErrErr,
            LUA_BREAK => CoStatus::Break,
            _ => CoStatus::ErrRun,
        }
    }

    /// Terminal error states; a coroutine in one of them never runs again.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            CoStatus::ErrRun | CoStatus::ErrSyntax | CoStatus::ErrMem | CoStatus::ErrErr
        )
    }

    /// Suspended states that accept another resume.
    pub fn is_suspended(self) -> bool {
        matches!(self, CoStatus::Yield | CoStatus::Break)
    }
}

/// Host-chosen identifier of an external function.
///
/// The bridge assigns no meaning to the value beyond handing it back to the
/// dispatcher. Zero is reserved for "no callback running".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(pub u64);

impl CallbackId {
    pub const NONE: CallbackId = CallbackId(0);

    /// Guest numbers are doubles, so the identifier travels as two 32-bit
    /// halves that each fit losslessly.
    pub(crate) fn split(self) -> (u32, u32) {
        ((self.0 & 0xFFFF_FFFF) as u32, (self.0 >> 32) as u32)
    }

    pub(crate) fn join(low: u32, high: u32) -> CallbackId {
        CallbackId((u64::from(high) << 32) | u64::from(low))
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for CallbackId {
    fn from(value: u64) -> Self {
        CallbackId(value)
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
