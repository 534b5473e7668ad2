use std::sync::Arc;

use dashmap::DashMap;

use super::chained_item::ChainError;
use super::item::ChainItem;
use super::items::{ScaleChainItem, SumErrorChainItem, SCALE_TAG, SUM_ERROR_TAG};

/// Builds a fresh stage instance.
pub type ChainItemFactory = dyn Fn() -> anyhow::Result<Arc<dyn ChainItem>> + Send + Sync;

// ---------------------------------------------------------------------------
// ChainItemRegistry
// ---------------------------------------------------------------------------

/// Maps stage tags to factories so chains can be reconfigured by name.
#[derive(Default)]
pub struct ChainItemRegistry {
    factories: DashMap<String, Arc<ChainItemFactory>>,
}

impl ChainItemRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the stock stages (`sum-error`, `scale`).
    #[must_use]
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(SUM_ERROR_TAG, || {
            Ok(Arc::new(SumErrorChainItem::new()?) as Arc<dyn ChainItem>)
        });
        registry.register(SCALE_TAG, || {
            Ok(Arc::new(ScaleChainItem::new()) as Arc<dyn ChainItem>)
        });
        registry
    }

    /// Registers `factory` under `tag`, replacing any previous factory.
    pub fn register<F>(&self, tag: impl Into<String>, factory: F)
    where
        F: Fn() -> anyhow::Result<Arc<dyn ChainItem>> + Send + Sync + 'static,
    {
        self.factories.insert(tag.into(), Arc::new(factory));
    }

    pub fn unregister(&self, tag: &str) -> bool {
        self.factories.remove(tag).is_some()
    }

    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    /// Registered tags, sorted.
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        tags.sort_unstable();
        tags
    }

    /// Instantiates the stage registered under `tag`.
    ///
    /// # Errors
    ///
    /// - [`ChainError::UnknownType`] if nothing is registered under `tag`.
    /// - [`ChainError::Construction`] if the factory fails.
    pub fn create(&self, tag: &str) -> Result<Arc<dyn ChainItem>, ChainError> {
        let factory = self
            .factories
            .get(tag)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ChainError::UnknownType(tag.to_string()))?;
        factory().map_err(|err| ChainError::Construction {
            type_name: tag.to_string(),
            reason: format!("{err:#}"),
        })
    }
}

impl std::fmt::Debug for ChainItemRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainItemRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}
