//! Name-keyed handler registry
//!
//! Backs both the job handler and the activity handler registries.

use crate::core::errors::{EngineError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of shared handlers by name
pub struct Registry<H: ?Sized> {
    kind: &'static str,
    handlers: Arc<RwLock<HashMap<String, Arc<H>>>>,
}

impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            handlers: self.handlers.clone(),
        }
    }
}

impl<H: ?Sized + Send + Sync> Registry<H> {
    /// Create a new empty registry; `kind` names the handlers in errors
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a handler. Names are unique.
    pub fn register(&self, name: impl Into<String>, handler: Arc<H>) -> Result<()> {
        let name = name.into();
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&name) {
            return Err(EngineError::configuration(format!(
                "{} {} is already registered",
                self.kind, name
            )));
        }
        handlers.insert(name, handler);
        Ok(())
    }

    /// Get a handler by name
    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        self.handlers.read().get(name).cloned()
    }

    /// Get a handler, failing with a configuration error when it is missing
    pub fn resolve(&self, name: &str) -> Result<Arc<H>> {
        self.get(name).ok_or_else(|| {
            EngineError::configuration(format!("no {} registered under {}", self.kind, name))
        })
    }

    /// Check if a handler is registered
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// List all registered names
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct Hello;

    impl Greeter for Hello {
        fn greet(&self) -> String {
            "hello".into()
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let registry: Registry<dyn Greeter> = Registry::new("greeter");
        registry.register("hello", Arc::new(Hello)).unwrap();

        assert!(registry.contains("hello"));
        assert_eq!(registry.resolve("hello").unwrap().greet(), "hello");
        assert_eq!(registry.list(), vec!["hello".to_string()]);

        let err = registry.register("hello", Arc::new(Hello)).unwrap_err();
        assert!(matches!(err, EngineError::Configuration { .. }));

        let err = registry.resolve("missing").err().unwrap();
        assert!(err.to_string().contains("no greeter registered under missing"));
    }
}
