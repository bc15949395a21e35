#[cfg(test)]
mod tests {
    use anyhow::Result;
    use luau_bridge::{Exec, StackOps, State};

    use crate::{LibraryRegistry, StdlibConfig};

    fn state() -> Result<State> {
        let state = State::new()?;
        state.open_libs();
        LibraryRegistry::standard(&StdlibConfig::default())?.install(&state)?;
        Ok(state)
    }

    #[test]
    fn test_get_reads_process_environment() -> Result<()> {
        let state = state()?;
        let path = std::env::var("PATH").unwrap_or_default();
        state.run("return env.get('PATH'), env.has('PATH')")?;
        assert_eq!(state.to_string(1).unwrap_or_default(), path);
        assert_eq!(state.to_boolean(2), std::env::var_os("PATH").is_some());
        Ok(())
    }

    #[test]
    fn test_get_falls_back_to_default() -> Result<()> {
        let state = state()?;
        state.run("return env.get('LBRIDGE_TEST_SURELY_UNSET', 'fallback'), env.get('LBRIDGE_TEST_SURELY_UNSET')")?;
        assert_eq!(state.to_string(1).as_deref(), Some("fallback"));
        assert!(state.is_nil(2));
        Ok(())
    }

    #[test]
    fn test_rejects_bad_names() -> Result<()> {
        let state = state()?;
        state.run("local ok, err = pcall(env.get, 'A=B') return ok, err")?;
        assert!(!state.to_boolean(1));
        assert!(state.to_string(2).unwrap_or_default().contains("variable name"));
        Ok(())
    }

    #[test]
    fn test_platform() -> Result<()> {
        let state = state()?;
        state.run("return env.os(), env.arch()")?;
        assert_eq!(state.to_string(1).as_deref(), Some(std::env::consts::OS));
        assert_eq!(state.to_string(2).as_deref(), Some(std::env::consts::ARCH));
        Ok(())
    }
}
