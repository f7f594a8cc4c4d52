//! The immutable set of feed modules known to the process.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::RegistryError;
use crate::feed::FeedModule;

/// Collects feed modules before startup.
#[derive(Default)]
pub struct FeedRegistryBuilder {
    modules: Vec<Arc<dyn FeedModule>>,
}

impl FeedRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module. Names must be unique.
    pub fn register(&mut self, module: Arc<dyn FeedModule>) -> Result<&mut Self, RegistryError> {
        if self.modules.iter().any(|m| m.name() == module.name()) {
            return Err(RegistryError::DuplicateFeed {
                name: module.name().to_string(),
            });
        }
        self.modules.push(module);
        Ok(self)
    }

    pub fn build(self) -> Arc<FeedRegistry> {
        let by_name = self
            .modules
            .iter()
            .enumerate()
            .map(|(i, m)| (m.name().to_string(), i))
            .collect();
        Arc::new(FeedRegistry {
            modules: self.modules,
            by_name,
        })
    }
}

/// Feed modules in registration order, looked up by name.
pub struct FeedRegistry {
    modules: Vec<Arc<dyn FeedModule>>,
    by_name: HashMap<String, usize>,
}

impl FeedRegistry {
    pub fn builder() -> FeedRegistryBuilder {
        FeedRegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn FeedModule>> {
        self.by_name.get(name).map(|&i| &self.modules[i])
    }

    pub fn modules(&self) -> &[Arc<dyn FeedModule>] {
        &self.modules
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(|m| m.name())
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl std::fmt::Debug for FeedRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FeedError;
    use crate::feed::{FeedPage, FeedRequest};
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl FeedModule for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn serve(&self, _request: &FeedRequest) -> Result<FeedPage, FeedError> {
            Ok(FeedPage::default())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut builder = FeedRegistry::builder();
        builder
            .register(Arc::new(Named("seattle")))
            .unwrap()
            .register(Arc::new(Named("chrono")))
            .unwrap();
        let registry = builder.build();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("chrono").map(|m| m.name()), Some("chrono"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["seattle", "chrono"]);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut builder = FeedRegistry::builder();
        builder.register(Arc::new(Named("seattle"))).unwrap();
        let err = builder.register(Arc::new(Named("seattle"))).err();
        assert_eq!(
            err,
            Some(RegistryError::DuplicateFeed {
                name: "seattle".to_string()
            })
        );
        assert_eq!(builder.build().len(), 1);
    }
}
