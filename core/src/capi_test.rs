#[cfg(test)]
mod tests {
    use std::ffi::{CStr, CString, c_char, c_int};
    use std::ptr;
    use std::sync::atomic::{AtomicU64, Ordering};

    use crate::capi::*;
    use crate::{CoStatus, ErrorCode, Type};

    fn run(state: *mut LBridgeState, source: &str) -> ErrorCode {
        let source = CString::new(source).unwrap();
        lbridge_dostring(state, source.as_ptr(), 0, ptr::null(), 2)
    }

    fn error_text(state: *mut LBridgeState) -> Option<String> {
        let raw = lbridge_geterror(state);
        if raw.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned())
    }

    fn global_number(state: *mut LBridgeState, name: &CStr) -> f64 {
        lbridge_getglobal(state, name.as_ptr());
        let value = lbridge_tonumber(state, -1);
        lbridge_pop(state, 1);
        value
    }

    unsafe extern "C-unwind" fn c_add(state: *mut LBridgeState) -> c_int {
        let sum = lbridge_tonumber(state, 1) + lbridge_tonumber(state, 2);
        lbridge_pushnumber(state, sum);
        1
    }

    unsafe extern "C-unwind" fn c_raise(state: *mut LBridgeState) -> c_int {
        lbridge_error(state, c"raised from C".as_ptr());
        0
    }

    static LAST_ID: AtomicU64 = AtomicU64::new(0);

    unsafe extern "C-unwind" fn c_dispatch(state: *mut LBridgeState, callback_id: u64) -> c_int {
        LAST_ID.store(lbridge_getcallbackid(state), Ordering::SeqCst);
        lbridge_pushinteger(state, (callback_id & 0xFFFF) as i64);
        1
    }

    unsafe extern "C-unwind" fn c_suspend(state: *mut LBridgeState) -> c_int {
        let top = lbridge_gettop(state);
        lbridge_yield(state, top)
    }

    unsafe extern "C-unwind" fn c_read_x(state: *mut LBridgeState) -> c_int {
        lbridge_getfield(state, 1, c"x".as_ptr());
        let message = lbridge_geterror(state);
        if !message.is_null() {
            lbridge_error(state, message);
        }
        1
    }

    unsafe extern "C-unwind" fn c_dispatch_guarded_access(state: *mut LBridgeState, _callback_id: u64) -> c_int {
        lbridge_pushstring(state, c"x".as_ptr());
        lbridge_gettable(state, 1);
        let failed = !lbridge_geterror(state).is_null();
        lbridge_pushboolean(state, c_int::from(failed));
        lbridge_pushnumber(state, 3.0);
        let code = lbridge_setfield(state, 1, c"y".as_ptr());
        lbridge_pushinteger(state, code as i64);
        3
    }

    const FAILING_TABLE: &str = "t = setmetatable({}, { __index = function() error('boom') end, \
                                 __newindex = function() error('no writes') end })";

    #[test]
    fn test_null_handles_are_safe() {
        let null = ptr::null_mut();
        lbridge_close(null);
        lbridge_openlibs(null);
        lbridge_pushnumber(null, 1.0);
        assert_eq!(lbridge_gettop(null), 0);
        assert_eq!(lbridge_type(null, 1), Type::Nil);
        assert_eq!(lbridge_tonumber(null, 1), 0.0);
        assert!(lbridge_tostring(null, 1).is_null());
        assert!(lbridge_geterror(null).is_null());
        assert_eq!(lbridge_memoryusage(null), 0);
        assert_eq!(lbridge_getcallbackid(null), 0);
        assert!(lbridge_newthread(null).is_null());
        assert!(lbridge_mainthread(null).is_null());
        assert_eq!(lbridge_dostring(null, c"x = 1".as_ptr(), 0, ptr::null(), 2), ErrorCode::InvalidArgument);
        assert_eq!(lbridge_pcall(null, 0, 0), ErrorCode::InvalidArgument);

        let dump = lbridge_dumpstack(null);
        assert_eq!(unsafe { CStr::from_ptr(dump) }.to_bytes(), b"");
        lbridge_freestring(dump);
    }

    #[test]
    fn test_dostring_and_error_slot() {
        let state = lbridge_new();
        assert!(!state.is_null());

        assert_eq!(run(state, "answer = 6 * 7"), ErrorCode::Ok);
        assert_eq!(global_number(state, c"answer"), 42.0);
        assert_eq!(error_text(state), None);

        assert_eq!(run(state, "this is not luau"), ErrorCode::CompileError);
        assert!(!error_text(state).unwrap_or_default().is_empty());
        lbridge_clearerror(state);
        lbridge_clearerror(state);
        assert_eq!(error_text(state), None);

        lbridge_openlibs(state);
        assert_eq!(run(state, "error('bad thing')"), ErrorCode::RuntimeError);
        assert!(error_text(state).unwrap_or_default().contains("bad thing"));

        assert_eq!(lbridge_dostring(state, c"x = 1".as_ptr(), 0, ptr::null(), 7), ErrorCode::InvalidArgument);
        lbridge_close(state);
    }

    #[test]
    fn test_compile_load_and_free() {
        let mut bytecode: *mut c_char = ptr::null_mut();
        let mut len: usize = 0;
        let source = c"return 'compiled'";
        let code = lbridge_compile(source.as_ptr(), 0, 1, &mut bytecode, &mut len);
        assert_eq!(code, ErrorCode::Ok);
        assert!(!bytecode.is_null());
        assert!(len > 0);

        let state = lbridge_new();
        assert_eq!(lbridge_loadbytecode(state, bytecode, len, c"=cached".as_ptr()), ErrorCode::Ok);
        assert_eq!(lbridge_pcall(state, 0, 1), ErrorCode::Ok);
        let mut out_len = 0usize;
        let text = lbridge_tolstring(state, -1, &mut out_len);
        assert_eq!(out_len, 8);
        assert_eq!(unsafe { CStr::from_ptr(text) }.to_bytes(), b"compiled");
        lbridge_freebytecode(bytecode);
        lbridge_freebytecode(bytecode);

        let code = lbridge_compile(c"local =".as_ptr(), 0, 2, &mut bytecode, &mut len);
        assert_eq!(code, ErrorCode::CompileError);
        assert!(bytecode.is_null());
        assert_eq!(len, 0);
        assert_eq!(
            lbridge_compile(ptr::null(), 0, 2, &mut bytecode, &mut len),
            ErrorCode::InvalidArgument
        );
        lbridge_close(state);
    }

    #[test]
    fn test_lstring_keeps_embedded_zeros() {
        let state = lbridge_new();
        let bytes = b"x\0y\0z";
        lbridge_pushlstring(state, bytes.as_ptr().cast(), bytes.len());
        lbridge_pushstring(state, ptr::null());
        assert_eq!(lbridge_isnil(state, -1), 1);
        assert_eq!(lbridge_strlen(state, 1), 5);
        let mut len = 0usize;
        let raw = lbridge_tolstring(state, 1, &mut len);
        assert_eq!(unsafe { std::slice::from_raw_parts(raw.cast::<u8>(), len) }, bytes);
        lbridge_close(state);
    }

    #[test]
    fn test_register_c_functions() {
        let state = lbridge_new();
        let regs = [
            LBridgeReg { name: c"add".as_ptr(), func: Some(c_add) },
            LBridgeReg { name: ptr::null(), func: None },
        ];
        assert_eq!(lbridge_register(state, regs.as_ptr()), ErrorCode::Ok);
        assert_eq!(run(state, "sum = add(2, 3)"), ErrorCode::Ok);
        assert_eq!(global_number(state, c"sum"), 5.0);

        lbridge_newtable(state);
        assert_eq!(lbridge_setfuncs(state, regs.as_ptr()), ErrorCode::Ok);
        lbridge_setglobal(state, c"mathx".as_ptr());
        assert_eq!(run(state, "other = mathx.add(1, 1)"), ErrorCode::Ok);
        assert_eq!(global_number(state, c"other"), 2.0);
        lbridge_close(state);
    }

    #[test]
    fn test_incomplete_registration_installs_nothing() {
        let state = lbridge_new();
        let regs = [
            LBridgeReg { name: c"first".as_ptr(), func: Some(c_add) },
            LBridgeReg { name: c"broken".as_ptr(), func: None },
            LBridgeReg { name: ptr::null(), func: None },
        ];
        assert_eq!(lbridge_register(state, regs.as_ptr()), ErrorCode::InvalidArgument);
        assert!(error_text(state).is_some());
        assert_eq!(lbridge_getglobal(state, c"first".as_ptr()), Type::Nil);
        assert_eq!(lbridge_register(state, ptr::null()), ErrorCode::InvalidArgument);

        lbridge_pushnil(state);
        assert_eq!(lbridge_setfuncs(state, regs.as_ptr()), ErrorCode::InvalidArgument);
        lbridge_close(state);
    }

    #[test]
    fn test_error_raised_from_c_function() {
        let state = lbridge_new();
        lbridge_pushcfunction(state, Some(c_raise), c"raise".as_ptr());
        lbridge_setglobal(state, c"raise".as_ptr());
        assert_eq!(run(state, "raise()"), ErrorCode::RuntimeError);
        assert!(error_text(state).unwrap_or_default().contains("raised from C"));
        assert_eq!(run(state, "still = 1"), ErrorCode::Ok);
        lbridge_close(state);
    }

    #[test]
    fn test_external_dispatch_through_c() {
        let state = lbridge_new();
        let id: u64 = 0x0000_0001_0000_0002;
        lbridge_setexternalcallback(state, Some(c_dispatch));
        let regs = [
            LBridgeExternalReg { name: c"ext".as_ptr(), callback_id: id },
            LBridgeExternalReg { name: ptr::null(), callback_id: 0 },
        ];
        assert_eq!(lbridge_registerexternals(state, regs.as_ptr()), ErrorCode::Ok);
        assert_eq!(run(state, "r = ext()"), ErrorCode::Ok);
        assert_eq!(LAST_ID.load(Ordering::SeqCst), id);
        assert_eq!(global_number(state, c"r"), 2.0);
        assert_eq!(lbridge_getcallbackid(state), 0);

        lbridge_setexternalcallback(state, None);
        assert_eq!(run(state, "r = ext()"), ErrorCode::Ok);
        lbridge_getglobal(state, c"r".as_ptr());
        assert_eq!(lbridge_isnil(state, -1), 1);
        lbridge_close(state);
    }

    #[test]
    fn test_coroutines_through_c() {
        let state = lbridge_new();
        lbridge_pushcfunction(state, Some(c_suspend), c"suspend".as_ptr());
        lbridge_setglobal(state, c"suspend".as_ptr());
        assert_eq!(run(state, "function co(a) local b = suspend(a * 2) return b + 1 end"), ErrorCode::Ok);

        let co = lbridge_newthread(state);
        assert!(!co.is_null());
        assert_eq!(lbridge_mainthread(co), state);
        assert_eq!(lbridge_isyieldable(state), 0);

        lbridge_getglobal(co, c"co".as_ptr());
        lbridge_pushnumber(co, 5.0);
        let mut nres: c_int = 0;
        assert_eq!(lbridge_resume(co, state, 1, &mut nres), CoStatus::Yield);
        assert_eq!(nres, 1);
        assert_eq!(lbridge_tonumber(co, -1), 10.0);
        assert_eq!(lbridge_status(co), CoStatus::Yield);

        lbridge_pop(co, nres);
        lbridge_pushnumber(co, 41.0);
        assert_eq!(lbridge_resume(co, ptr::null_mut(), 1, &mut nres), CoStatus::Ok);
        assert_eq!(lbridge_tonumber(co, -1), 42.0);

        assert_eq!(lbridge_resume(state, ptr::null_mut(), 0, &mut nres), CoStatus::ErrRun);

        lbridge_close(state);
        assert_eq!(lbridge_gettop(co), 0);
        assert!(lbridge_mainthread(co).is_null());
        lbridge_close(co);
    }

    #[test]
    fn test_memory_and_debug_helpers() {
        let state = lbridge_new();
        lbridge_openlibs(state);
        let used = lbridge_memoryusage(state);
        assert!(used > 1024);
        lbridge_gc(state);
        assert_eq!(lbridge_checkstack(state, 10), 1);

        lbridge_pushinteger(state, 3);
        let dump = lbridge_dumpstack(state);
        let text = unsafe { CStr::from_ptr(dump) }.to_string_lossy().into_owned();
        lbridge_freestring(dump);
        assert_eq!(text, "Stack size: 1\n[1] number: 3.0\n");

        let name = unsafe { CStr::from_ptr(lbridge_typename(state, Type::Table as c_int)) };
        assert_eq!(name.to_bytes(), b"table");
        let version = unsafe { CStr::from_ptr(lbridge_version()) };
        assert_eq!(version.to_str().unwrap(), crate::version());
        lbridge_close(state);
    }

    #[test]
    fn test_metamethod_error_in_c_function_is_catchable() {
        let state = lbridge_new();
        lbridge_openlibs(state);
        lbridge_pushcfunction(state, Some(c_read_x), c"read_x".as_ptr());
        lbridge_setglobal(state, c"read_x".as_ptr());
        assert_eq!(run(state, FAILING_TABLE), ErrorCode::Ok);

        assert_eq!(run(state, "return read_x(t)"), ErrorCode::RuntimeError);
        assert!(error_text(state).unwrap_or_default().contains("boom"));
        assert_eq!(run(state, "v = read_x({ x = 4 })"), ErrorCode::Ok);
        assert_eq!(global_number(state, c"v"), 4.0);
        lbridge_close(state);
    }

    #[test]
    fn test_metamethod_errors_in_c_dispatcher_are_reported() {
        let state = lbridge_new();
        lbridge_openlibs(state);
        lbridge_setexternalcallback(state, Some(c_dispatch_guarded_access));
        assert_eq!(lbridge_registerexternal(state, c"inspect".as_ptr(), 9), ErrorCode::Ok);
        assert_eq!(run(state, FAILING_TABLE), ErrorCode::Ok);

        assert_eq!(run(state, "v, failed, code = inspect(t)"), ErrorCode::Ok);
        lbridge_getglobal(state, c"v".as_ptr());
        assert_eq!(lbridge_isnil(state, -1), 1);
        lbridge_pop(state, 1);
        lbridge_getglobal(state, c"failed".as_ptr());
        assert_eq!(lbridge_toboolean(state, -1), 1);
        lbridge_pop(state, 1);
        assert_eq!(global_number(state, c"code"), ErrorCode::RuntimeError as i32 as f64);
        lbridge_close(state);
    }
}
