#[cfg(test)]
mod tests {
    use crate::{CallbackId, Error, Exec, Outcome, StackOps, State, TableOps, Type};

    #[test]
    fn test_new_state_is_open_and_unique() -> anyhow::Result<()> {
        let a = State::new()?;
        let b = State::new()?;
        assert!(!a.is_closed());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.top(), 0);
        Ok(())
    }

    #[test]
    fn test_close_is_idempotent() -> anyhow::Result<()> {
        let mut state = State::new()?;
        state.close();
        state.close();
        assert!(state.is_closed());
        Ok(())
    }

    #[test]
    fn test_closed_state_is_null_safe() -> anyhow::Result<()> {
        let mut state = State::new()?;
        state.close();

        state.push_number(1.0);
        state.push_string("ignored");
        assert_eq!(state.top(), 0);
        assert_eq!(state.type_of(-1), Type::Nil);
        assert_eq!(state.to_number(1), 0.0);
        assert_eq!(state.to_string(1), None);
        assert_eq!(state.memory_usage(), 0);
        assert_eq!(state.dump_stack(), "");
        assert!(!state.check_stack(1));

        let err = state.run("x = 1").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(matches!(state.get_global("x"), Err(Error::InvalidArgument(_))));
        assert!(state.new_thread().is_err());
        Ok(())
    }

    #[test]
    fn test_open_libs_installs_builtins() -> anyhow::Result<()> {
        let state = State::new()?;
        assert_eq!(state.get_global("math")?, Type::Nil);
        state.pop(1);

        state.open_libs();
        assert_eq!(state.get_global("math")?, Type::Table);
        state.pop(1);
        state.run("result = string.upper('abc')")?;
        state.get_global("result")?;
        assert_eq!(state.to_string(-1).as_deref(), Some("ABC"));
        Ok(())
    }

    #[test]
    fn test_sandbox_by_removing_globals() -> anyhow::Result<()> {
        let state = State::new()?;
        state.open_libs();
        state.remove_global("os")?;
        assert_eq!(state.get_global("os")?, Type::Nil);
        Ok(())
    }

    #[test]
    fn test_memory_usage_combines_kilobytes_and_remainder() -> anyhow::Result<()> {
        let state = State::new()?;
        state.open_libs();
        let before = state.memory_usage();
        assert!(before > 1024);

        state.run("big = {} for i = 1, 10000 do big[i] = tostring(i) end")?;
        let grown = state.memory_usage();
        assert!(grown > before);

        state.run("big = nil")?;
        state.collect_garbage();
        assert!(state.memory_usage() < grown);
        Ok(())
    }

    #[test]
    fn test_dispatcher_is_replaced_not_chained() -> anyhow::Result<()> {
        let state = State::new()?;
        assert!(!state.has_dispatcher());
        state.register_external("lookup", CallbackId(1))?;

        state.set_dispatch_fn(|frame, _| {
            frame.push_number(1.0);
            Ok(Outcome::returns(1))
        });
        state.set_dispatch_fn(|frame, _| {
            frame.push_number(2.0);
            Ok(Outcome::returns(1))
        });
        state.run("seen = lookup()")?;
        state.get_global("seen")?;
        assert_eq!(state.to_number(-1), 2.0);
        state.pop(1);

        state.clear_dispatcher();
        assert!(!state.has_dispatcher());
        state.run("seen = lookup()")?;
        state.get_global("seen")?;
        assert!(state.is_nil(-1));
        Ok(())
    }

    #[test]
    fn test_callback_id_absent_outside_calls() -> anyhow::Result<()> {
        let state = State::new()?;
        assert_eq!(state.callback_id(), None);
        Ok(())
    }
}
