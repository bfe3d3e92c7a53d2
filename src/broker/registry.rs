//! Explicit broker registry.
//!
//! Maps a broker name to a constructor. The composition root builds one and
//! passes it to whatever selects the broker; nothing is registered globally.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::{Broker, BrokerError, BrokerOptions, Result};

/// Builds a broker from options.
pub type BrokerConstructor =
    Arc<dyn Fn(BrokerOptions) -> Result<Box<dyn Broker>> + Send + Sync>;

/// Name -> constructor map.
#[derive(Default, Clone)]
pub struct BrokerRegistry {
    constructors: HashMap<String, BrokerConstructor>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor, replacing any previous one with the same name.
    pub fn register(&mut self, name: impl Into<String>, constructor: BrokerConstructor) {
        self.constructors.insert(name.into(), constructor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Construct the broker registered under `name`.
    pub fn build(&self, name: &str, options: BrokerOptions) -> Result<Box<dyn Broker>> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| BrokerError::UnknownBroker(name.to_string()))?;

        let broker = constructor(options)?;
        info!(broker = name, "Broker constructed");
        Ok(broker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_broker() {
        let registry = BrokerRegistry::new();
        let result = registry.build("nsq", BrokerOptions::default());
        assert!(matches!(result, Err(BrokerError::UnknownBroker(name)) if name == "nsq"));
    }

    #[test]
    fn test_register_and_names() {
        let mut registry = BrokerRegistry::new();
        let failing: BrokerConstructor =
            Arc::new(|_| Err(BrokerError::InvalidOption("unused".to_string())));
        registry.register("zeta", failing.clone());
        registry.register("alpha", failing);

        assert!(registry.contains("alpha"));
        assert!(!registry.contains("nsq"));
        assert_eq!(registry.names(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_constructor_error_propagates() {
        let mut registry = BrokerRegistry::new();
        registry.register(
            "broken",
            Arc::new(|_| Err(BrokerError::InvalidOption("bad".to_string()))),
        );

        let result = registry.build("broken", BrokerOptions::default());
        assert!(matches!(result, Err(BrokerError::InvalidOption(_))));
    }
}
