#[cfg(test)]
mod tests {
    use crate::{Error, ErrorCode, Exec, MULTRET, OptLevel, RunOptions, StackOps, State, TableOps, compile};

    fn global_number(state: &State, name: &str) -> anyhow::Result<f64> {
        state.get_global(name)?;
        let value = state.to_number(-1);
        state.pop(1);
        Ok(value)
    }

    #[test]
    fn test_run_source_sets_globals_at_every_level() -> anyhow::Result<()> {
        for level in [OptLevel::None, OptLevel::O1, OptLevel::O2] {
            let state = State::new()?;
            let options = RunOptions::default().opt_level(level);
            state.run_source(b"local t = {1, 2, 3}\nresult = #t * 10 + t[2]", &options)?;
            assert_eq!(global_number(&state, "result")?, 32.0, "level {:?}", level);
        }
        Ok(())
    }

    #[test]
    fn test_compile_error_keeps_state_usable() -> anyhow::Result<()> {
        let state = State::new()?;
        let err = state.run("local = = 1").unwrap_err();
        assert!(matches!(err, Error::Compile(_)));
        assert_eq!(err.code(), ErrorCode::CompileError);
        let message = state.last_error().unwrap_or_default();
        assert!(!message.is_empty());
        assert_eq!(message, err.message());

        state.run("ok = 1")?;
        assert_eq!(state.last_error(), None, "success clears the previous error");
        assert_eq!(global_number(&state, "ok")?, 1.0);
        Ok(())
    }

    #[test]
    fn test_runtime_error_is_distinguished() -> anyhow::Result<()> {
        let state = State::new()?;
        state.open_libs();
        let options = RunOptions::default().chunk_name("=boot");
        let err = state.run_source(b"error('boom')", &options).unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
        assert_eq!(err.code(), ErrorCode::RuntimeError);
        assert!(err.message().contains("boom"));
        assert!(err.message().contains("boot"), "chunk name shows up: {}", err.message());
        assert_eq!(state.top(), 0, "the error value is popped");
        Ok(())
    }

    #[test]
    fn test_non_string_error_uses_fallback_message() -> anyhow::Result<()> {
        let state = State::new()?;
        state.open_libs();
        let err = state.run("error({})").unwrap_err();
        assert_eq!(err, Error::Runtime("Runtime error".to_string()));
        Ok(())
    }

    #[test]
    fn test_compile_and_load_bytecode() -> anyhow::Result<()> {
        let bytecode = compile(b"return 1 + 2, 'x'", OptLevel::O2)?;
        assert_ne!(bytecode.first(), Some(&0));

        let state = State::new()?;
        state.load_bytecode(&bytecode, "=precompiled")?;
        assert!(state.is_function(-1));
        state.pcall(0, MULTRET)?;
        assert_eq!(state.top(), 2);
        assert_eq!(state.to_number(1), 3.0);
        assert_eq!(state.to_string(2).as_deref(), Some("x"));
        Ok(())
    }

    #[test]
    fn test_compile_error_message_is_extracted() {
        let err = compile(b"if then", OptLevel::O1).unwrap_err();
        match err {
            Error::Compile(message) => {
                assert!(!message.is_empty());
                assert!(!message.starts_with('\0'));
            }
            other => panic!("expected compile error, got {:?}", other),
        }
    }

    #[test]
    fn test_load_failure_maps_to_compile_code() -> anyhow::Result<()> {
        let state = State::new()?;
        let err = state.load_bytecode(&[0xff, 0x01, 0x02], "=bad").unwrap_err();
        assert!(matches!(err, Error::Load(_)));
        assert_eq!(err.code(), ErrorCode::CompileError);
        assert!(state.last_error().is_some());
        assert_eq!(state.top(), 0);

        let err = state.load_bytecode(&[], "=empty").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        Ok(())
    }

    #[test]
    fn test_pcall_with_arguments_and_fixed_results() -> anyhow::Result<()> {
        let state = State::new()?;
        state.run("function add(a, b) return a + b, a * b, 'extra' end")?;
        state.get_global("add")?;
        state.push_number(3.0);
        state.push_number(4.0);
        state.pcall(2, 2)?;
        assert_eq!(state.top(), 2);
        assert_eq!(state.to_number(1), 7.0);
        assert_eq!(state.to_number(2), 12.0);
        Ok(())
    }

    #[test]
    fn test_pcall_without_function_is_invalid() -> anyhow::Result<()> {
        let state = State::new()?;
        let err = state.pcall(1, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        Ok(())
    }

    #[test]
    fn test_error_code_of_result() {
        let ok: crate::Result<()> = Ok(());
        assert_eq!(ErrorCode::of(&ok), ErrorCode::Ok);
        let err: crate::Result<()> = Err(Error::Memory("oom".into()));
        assert_eq!(ErrorCode::of(&err), ErrorCode::MemoryError);
        assert_eq!(ErrorCode::InvalidArgument as i32, 4);
    }
}
