#[cfg(test)]
mod tests {
    use anyhow::Result;
    use luau_bridge::{Exec, Frame, Outcome, StackOps, State, TableOps, Type};

    use crate::{Export, Library, LibraryRegistry, StdlibConfig};

    #[derive(Debug)]
    struct Greeter {
        enabled: bool,
    }

    impl Library for Greeter {
        fn name(&self) -> &str {
            "greeter"
        }

        fn enabled(&self) -> bool {
            self.enabled
        }

        fn exports(&self) -> Vec<Export> {
            vec![Export::new("hello", |frame: &Frame| {
                let who = frame.to_string(1).unwrap_or_else(|| "world".to_string());
                frame.push_string(&format!("hello, {who}"));
                Ok(Outcome::returns(1))
            })]
        }
    }

    #[test]
    fn test_standard_set() -> Result<()> {
        let registry = LibraryRegistry::standard(&StdlibConfig::default())?;
        assert_eq!(registry.library_names(), vec!["json", "time", "env", "log", "kv", "http"]);
        assert!(registry.get_library("require").is_err(), "require needs a library directory");
        assert_eq!(registry.get_library("json")?.name(), "json");
        assert!(!registry.get_library("kv")?.description().is_empty());
        Ok(())
    }

    #[test]
    fn test_install_binds_global_tables() -> Result<()> {
        let state = State::new()?;
        let registry = LibraryRegistry::standard(&StdlibConfig::default())?;
        registry.install(&state)?;
        assert!(state.has_dispatcher());
        for name in registry.library_names() {
            assert_eq!(state.get_global(&name)?, Type::Table, "{name}");
            state.pop(1);
        }
        assert!(registry.functions().len() >= 15);
        assert_eq!(state.top(), 0);
        Ok(())
    }

    #[test]
    fn test_duplicate_library_is_rejected() -> Result<()> {
        let mut registry = LibraryRegistry::new();
        registry.register_library(Box::new(Greeter { enabled: true }))?;
        let err = registry.register_library(Box::new(Greeter { enabled: true })).unwrap_err();
        assert!(err.to_string().contains("already registered"));
        Ok(())
    }

    #[test]
    fn test_custom_library() -> Result<()> {
        let state = State::new()?;
        let mut registry = LibraryRegistry::new();
        registry.register_library(Box::new(Greeter { enabled: true }))?;
        registry.install(&state)?;
        state.run("return greeter.hello('luau'), greeter.hello()")?;
        assert_eq!(state.to_string(1).as_deref(), Some("hello, luau"));
        assert_eq!(state.to_string(2).as_deref(), Some("hello, world"));
        Ok(())
    }

    #[test]
    fn test_disabled_library_is_skipped() -> Result<()> {
        let state = State::new()?;
        let mut registry = LibraryRegistry::new();
        registry.register_library(Box::new(Greeter { enabled: false }))?;
        registry.install(&state)?;
        assert_eq!(state.get_global("greeter")?, Type::Nil);
        assert!(registry.functions().is_empty());
        Ok(())
    }

    #[test]
    fn test_log_accepts_any_arguments() -> Result<()> {
        let state = State::new()?;
        state.open_libs();
        LibraryRegistry::standard(&StdlibConfig::default())?.install(&state)?;
        state.run("log.info('count', 3, true, nil, { a = 1 }) log.debug() log.warn(print) log.error('x')")?;
        assert_eq!(state.top(), 0, "log functions return nothing");
        Ok(())
    }
}
