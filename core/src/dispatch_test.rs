#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::{
        CallbackId, Error, Exec, Frame, FuncReg, FunctionTable, Outcome, StackOps, State, TableOps, Type,
    };

    fn add(frame: &Frame) -> crate::Result<Outcome> {
        let sum = frame.to_number(1) + frame.to_number(2);
        frame.push_number(sum);
        Ok(Outcome::returns(1))
    }

    fn fail(_frame: &Frame) -> crate::Result<Outcome> {
        Err(Error::runtime("host refused"))
    }

    fn explode(_frame: &Frame) -> crate::Result<Outcome> {
        panic!("kaboom");
    }

    fn read_field(frame: &Frame) -> crate::Result<Outcome> {
        frame.get_field(1, "x")?;
        Ok(Outcome::returns(1))
    }

    fn write_field(frame: &Frame) -> crate::Result<Outcome> {
        frame.push_number(1.0);
        frame.set_field(1, "x")?;
        Ok(Outcome::NONE)
    }

    fn read_or_default(frame: &Frame) -> crate::Result<Outcome> {
        if frame.get_field(1, "x").is_err() {
            frame.pop(1);
            frame.push_string("fallback");
        }
        Ok(Outcome::returns(1))
    }

    const FAILING_INDEX: &str = "t = setmetatable({}, { __index = function() error('boom') end, \
                                 __newindex = function() error('no writes') end })";

    fn global_number(state: &State, name: &str) -> anyhow::Result<f64> {
        state.get_global(name)?;
        let value = state.to_number(-1);
        state.pop(1);
        Ok(value)
    }

    #[test]
    fn test_callback_id_visible_inside_and_cleared_after() -> anyhow::Result<()> {
        let state = State::new()?;
        let wide = CallbackId(0xDEAD_BEEF_0000_0001);
        let seen = Arc::new(AtomicU64::new(0));
        let seen_in = Arc::clone(&seen);
        state.set_dispatch_fn(move |frame, id| {
            assert_eq!(frame.callback_id(), Some(id));
            seen_in.store(id.0, Ordering::SeqCst);
            Ok(Outcome::NONE)
        });
        state.register_external("wide", wide)?;
        state.run("wide()")?;

        assert_eq!(seen.load(Ordering::SeqCst), wide.0);
        assert_eq!(state.callback_id(), None);
        Ok(())
    }

    #[test]
    fn test_nested_callbacks_restore_outer_id() -> anyhow::Result<()> {
        let state = State::new()?;
        let after_inner = Arc::new(Mutex::new(None));
        let record = Arc::clone(&after_inner);
        state.set_dispatch_fn(move |frame, id| {
            if id == CallbackId(1) {
                frame.get_global("inner")?;
                frame.pcall(0, 0)?;
                *record.lock().unwrap() = frame.callback_id();
            }
            Ok(Outcome::NONE)
        });
        state.register(&[FuncReg::external("outer", CallbackId(1)), FuncReg::external("inner", CallbackId(2))])?;
        state.run("outer()")?;

        assert_eq!(*after_inner.lock().unwrap(), Some(CallbackId(1)));
        assert_eq!(state.callback_id(), None);
        Ok(())
    }

    #[test]
    fn test_external_call_without_dispatcher_returns_nothing() -> anyhow::Result<()> {
        let state = State::new()?;
        state.register_external("orphan", CallbackId(7))?;
        state.run("a, b = orphan(1, 2)")?;
        state.get_global("a")?;
        assert!(state.is_nil(-1));
        Ok(())
    }

    #[test]
    fn test_function_table_routes_by_id() -> anyhow::Result<()> {
        let state = State::new()?;
        let table = Arc::new(FunctionTable::new());
        let double = table.insert("double", |frame| {
            let n = frame.to_number(1);
            frame.push_number(n * 2.0);
            Ok(Outcome::returns(1))
        });
        let greet = table.insert("greet", |frame| {
            let name = frame.to_string(1).unwrap_or_default();
            frame.push_string(&format!("hello {}", name));
            Ok(Outcome::returns(1))
        });
        assert_ne!(double, greet);
        assert_eq!(table.len(), 2);
        assert_eq!(table.name_of(greet).as_deref(), Some("greet"));

        state.set_dispatcher(Arc::clone(&table));
        state.register(&[FuncReg::external("double", double), FuncReg::external("greet", greet)])?;
        state.run("x = double(21)\ng = greet('luau')")?;
        assert_eq!(global_number(&state, "x")?, 42.0);
        state.get_global("g")?;
        assert_eq!(state.to_string(-1).as_deref(), Some("hello luau"));
        state.pop(1);

        assert!(table.remove(double));
        state.run("x = double(21)")?;
        state.get_global("x")?;
        assert!(state.is_nil(-1), "unknown ids return no results");
        Ok(())
    }

    #[test]
    fn test_native_function_arguments_and_results() -> anyhow::Result<()> {
        let state = State::new()?;
        state.register(&[FuncReg::native("add", add)])?;
        state.run("sum = add(40, 2)")?;
        assert_eq!(global_number(&state, "sum")?, 42.0);
        Ok(())
    }

    #[test]
    fn test_host_error_becomes_runtime_error() -> anyhow::Result<()> {
        let state = State::new()?;
        state.open_libs();
        state.register(&[FuncReg::native("fail", fail)])?;

        let err = state.run("fail()").unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
        assert!(err.message().contains("host refused"));

        state.run("ok, msg = pcall(fail)")?;
        state.get_global("msg")?;
        assert!(state.to_string(-1).unwrap_or_default().contains("host refused"));
        Ok(())
    }

    #[test]
    fn test_host_panic_is_contained() -> anyhow::Result<()> {
        let state = State::new()?;
        state.register(&[FuncReg::native("explode", explode)])?;
        let err = state.run("explode()").unwrap_err();
        assert!(err.message().contains("host function panicked: kaboom"));

        state.run("after = 1")?;
        assert_eq!(global_number(&state, "after")?, 1.0);
        Ok(())
    }

    #[test]
    fn test_declared_results_are_capped_at_pushed_values() -> anyhow::Result<()> {
        let state = State::new()?;
        state.set_dispatch_fn(|frame, _| {
            frame.set_top(0);
            frame.push_number(5.0);
            Ok(Outcome::returns(3))
        });
        state.register_external("short", CallbackId(3))?;
        state.run("a, b = short()")?;
        assert_eq!(global_number(&state, "a")?, 5.0);
        state.get_global("b")?;
        assert!(state.is_nil(-1));
        Ok(())
    }

    #[test]
    fn test_bulk_registration_validates_names_first() -> anyhow::Result<()> {
        let state = State::new()?;
        let err = state
            .register(&[FuncReg::native("good", add), FuncReg::native("bad\0name", add)])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(state.get_global("good")?, Type::Nil, "nothing is installed");
        Ok(())
    }

    #[test]
    fn test_set_funcs_fills_a_table() -> anyhow::Result<()> {
        let state = State::new()?;
        state.new_table();
        state.set_funcs(-1, &[FuncReg::native("add", add), FuncReg::external("ext", CallbackId(9))])?;
        state.set_global("util")?;
        state.run("r = util.add(1, 2)")?;
        assert_eq!(global_number(&state, "r")?, 3.0);
        state.get_global("util")?;
        assert_eq!(state.get_field(-1, "ext")?, Type::Function);
        Ok(())
    }

    #[test]
    fn test_unregister_removes_binding() -> anyhow::Result<()> {
        let state = State::new()?;
        state.register(&[FuncReg::native("add", add)])?;
        state.unregister("add")?;
        assert_eq!(state.get_global("add")?, Type::Nil);
        Ok(())
    }

    #[test]
    fn test_callback_id_halves() {
        let id = CallbackId(0x1234_5678_9ABC_DEF0);
        let (low, high) = id.split();
        assert_eq!(low, 0x9ABC_DEF0);
        assert_eq!(high, 0x1234_5678);
        assert_eq!(CallbackId::join(low, high), id);
    }

    #[test]
    fn test_metamethod_error_in_native_function_reaches_pcall() -> anyhow::Result<()> {
        let state = State::new()?;
        state.open_libs();
        state.register(&[FuncReg::native("read_field", read_field), FuncReg::native("write_field", write_field)])?;
        state.run(FAILING_INDEX)?;

        let err = state.run("return read_field(t)").unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
        assert!(err.message().contains("boom"), "{}", err.message());

        let err = state.run("write_field(t)").unwrap_err();
        assert!(err.message().contains("no writes"), "{}", err.message());

        state.set_top(0);
        state.run("return read_field({ x = 5 })")?;
        assert_eq!(state.to_number(-1), 5.0);
        Ok(())
    }

    #[test]
    fn test_metamethods_run_inside_host_functions() -> anyhow::Result<()> {
        let state = State::new()?;
        state.open_libs();
        state.register(&[FuncReg::native("read_field", read_field)])?;
        state.run("return read_field(setmetatable({}, { __index = function(_, k) return k .. '!' end }))")?;
        assert_eq!(state.to_string(-1).as_deref(), Some("x!"));
        Ok(())
    }

    #[test]
    fn test_host_function_can_recover_from_metamethod_error() -> anyhow::Result<()> {
        let state = State::new()?;
        state.open_libs();
        state.register(&[FuncReg::native("read_or_default", read_or_default)])?;
        state.run(FAILING_INDEX)?;
        state.run("return read_or_default(t)")?;
        assert_eq!(state.to_string(-1).as_deref(), Some("fallback"));
        Ok(())
    }

    #[test]
    fn test_metamethod_error_in_dispatched_function_reaches_pcall() -> anyhow::Result<()> {
        let state = State::new()?;
        state.open_libs();
        let table = Arc::new(FunctionTable::new());
        let index_id = table.insert("index", |frame: &Frame| {
            frame.push_string("x");
            frame.get_table(1)?;
            Ok(Outcome::returns(1))
        });
        let store_id = table.insert("store", |frame: &Frame| {
            frame.push_string("x");
            frame.push_number(2.0);
            frame.set_table(1)?;
            Ok(Outcome::NONE)
        });
        state.set_dispatcher(Arc::clone(&table));
        state.register(&[FuncReg::external("index", index_id), FuncReg::external("store", store_id)])?;
        state.run(FAILING_INDEX)?;

        let err = state.run("return index(t)").unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
        assert!(err.message().contains("boom"));
        assert_eq!(state.callback_id(), None);

        let err = state.run("store(t)").unwrap_err();
        assert!(err.message().contains("no writes"));
        assert_eq!(state.callback_id(), None);
        Ok(())
    }

    #[test]
    fn test_nested_guest_error_propagates_through_host_function() -> anyhow::Result<()> {
        let state = State::new()?;
        state.open_libs();
        state.set_dispatch_fn(|frame, _id| {
            frame.get_global("thrower")?;
            frame.pcall(0, 0)?;
            Ok(Outcome::NONE)
        });
        state.register_external("relay", CallbackId(3))?;
        state.run("function thrower() error('nested failure') end")?;

        let err = state.run("relay()").unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
        assert!(err.message().contains("nested failure"));
        assert_eq!(state.callback_id(), None);
        state.run("ok_after = 1")?;
        Ok(())
    }

    #[test]
    fn test_invalid_raw_stores_are_reported() -> anyhow::Result<()> {
        let state = State::new()?;
        state.open_libs();

        state.new_table();
        state.push_nil();
        state.push_number(1.0);
        assert!(state.raw_set(1).is_err());
        assert_eq!(state.top(), 1);

        state.run("frozen = table.freeze({})")?;
        state.set_top(0);
        state.get_global("frozen")?;
        state.push_number(1.0);
        assert!(state.set_field(1, "x").is_err());
        assert!(state.last_error().unwrap_or_default().contains("readonly"));
        assert_eq!(state.top(), 1);
        Ok(())
    }
}
