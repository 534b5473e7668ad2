//! Chain stage contract and the attribute-binder helper shared by stages.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use datahive_core::{Attributes, Variant};
use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// Attribute write results
// ---------------------------------------------------------------------------

/// Outcome of writing one attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteAttributeResult {
    Ok,
    /// No stage accepted the key.
    NotHandled,
    /// The key is published by a stage and cannot be written.
    Reserved,
    Failed(String),
}

impl WriteAttributeResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Per-key results of an attribute write.
pub type WriteAttributeResults = BTreeMap<String, WriteAttributeResult>;

// ---------------------------------------------------------------------------
// ChainItem
// ---------------------------------------------------------------------------

/// One processing stage in a data item's chain.
///
/// Stages run in chain order; each sees the attribute map as left by the
/// stages before it.
pub trait ChainItem: Send + Sync {
    /// Stable tag identifying the stage type in the registry.
    fn type_name(&self) -> &str;

    /// Processes `value`, optionally editing `attributes`.
    ///
    /// Returning `Some` replaces the value seen by later stages.
    ///
    /// # Errors
    ///
    /// An error is contained by the item: it is recorded as
    /// `<type_name>.error` and the pass continues with the next stage.
    fn process(&self, value: &Variant, attributes: &mut Attributes) -> anyhow::Result<Option<Variant>>;

    /// Offers an attribute write to the stage. Keys the stage does not know
    /// are left out of the result.
    fn set_attributes(&self, _attributes: &Attributes) -> WriteAttributeResults {
        WriteAttributeResults::new()
    }

    /// Whether the stage's configuration should survive a restart.
    fn is_persistent(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// AttributeBinder
// ---------------------------------------------------------------------------

/// Hook bound to an attribute key; applies a side effect whenever the
/// attribute is written.
pub trait AttributeBinder: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the side effect could not be applied. The error is
    /// reported as [`WriteAttributeResult::Failed`] for the key.
    fn bind(&self, value: &Variant) -> anyhow::Result<()>;

    /// Current value to publish under the bound key, if any.
    fn attribute_value(&self) -> Option<Variant> {
        None
    }
}

/// Binder that just remembers the last value written to it.
#[derive(Debug, Default)]
pub struct VariantBinder {
    value: Mutex<Variant>,
}

impl VariantBinder {
    #[must_use]
    pub fn new(initial: Variant) -> Self {
        Self {
            value: Mutex::new(initial),
        }
    }

    #[must_use]
    pub fn value(&self) -> Variant {
        self.value.lock().clone()
    }
}

impl AttributeBinder for VariantBinder {
    fn bind(&self, value: &Variant) -> anyhow::Result<()> {
        *self.value.lock() = value.clone();
        Ok(())
    }

    fn attribute_value(&self) -> Option<Variant> {
        let value = self.value.lock();
        (!value.is_null()).then(|| value.clone())
    }
}

// ---------------------------------------------------------------------------
// ChainItemBase
// ---------------------------------------------------------------------------

/// Binder table a stage can embed to route attribute writes.
#[derive(Default)]
pub struct ChainItemBase {
    binders: BTreeMap<String, Arc<dyn AttributeBinder>>,
    reserved: BTreeSet<String>,
}

impl ChainItemBase {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_binder(&mut self, key: impl Into<String>, binder: Arc<dyn AttributeBinder>) {
        self.binders.insert(key.into(), binder);
    }

    /// Marks keys the stage publishes itself; writes to them are rejected.
    pub fn set_reserved_attributes<I, S>(&mut self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reserved = keys.into_iter().map(Into::into).collect();
    }

    #[must_use]
    pub fn is_reserved(&self, key: &str) -> bool {
        self.reserved.contains(key)
    }

    /// Routes each written key to its binder.
    pub fn set_attributes(&self, attributes: &Attributes) -> WriteAttributeResults {
        let mut results = WriteAttributeResults::new();
        for (key, value) in attributes {
            if self.is_reserved(key) {
                results.insert(key.clone(), WriteAttributeResult::Reserved);
            } else if let Some(binder) = self.binders.get(key) {
                let result = match binder.bind(value) {
                    Ok(()) => WriteAttributeResult::Ok,
                    Err(err) => WriteAttributeResult::Failed(format!("{err:#}")),
                };
                results.insert(key.clone(), result);
            }
        }
        results
    }

    /// Publishes every binder's current value into `attributes`.
    pub fn publish(&self, attributes: &mut Attributes) {
        for (key, binder) in &self.binders {
            if let Some(value) = binder.attribute_value() {
                attributes.insert(key.clone(), value);
            }
        }
    }
}

impl std::fmt::Debug for ChainItemBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainItemBase")
            .field("binders", &self.binders.keys().collect::<Vec<_>>())
            .field("reserved", &self.reserved)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingBinder;

    impl AttributeBinder for FailingBinder {
        fn bind(&self, _value: &Variant) -> anyhow::Result<()> {
            anyhow::bail!("rejected")
        }
    }

    fn attrs(pairs: &[(&str, Variant)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn routes_writes_to_binders() {
        let binder = Arc::new(VariantBinder::default());
        let mut base = ChainItemBase::new();
        base.add_binder("a.limit", Arc::clone(&binder) as _);

        let results = base.set_attributes(&attrs(&[
            ("a.limit", Variant::Long(5)),
            ("unknown", Variant::Bool(true)),
        ]));

        assert_eq!(results.get("a.limit"), Some(&WriteAttributeResult::Ok));
        assert!(!results.contains_key("unknown"));
        assert_eq!(binder.value(), Variant::Long(5));
    }

    #[test]
    fn reserved_keys_are_rejected() {
        let binder = Arc::new(VariantBinder::default());
        let mut base = ChainItemBase::new();
        base.add_binder("a.value", Arc::clone(&binder) as _);
        base.set_reserved_attributes(["a.value"]);

        let results = base.set_attributes(&attrs(&[("a.value", Variant::from("x"))]));

        assert_eq!(results.get("a.value"), Some(&WriteAttributeResult::Reserved));
        assert!(binder.value().is_null());
    }

    #[test]
    fn binder_failure_is_reported() {
        let mut base = ChainItemBase::new();
        base.add_binder("a.bad", Arc::new(FailingBinder));

        let results = base.set_attributes(&attrs(&[("a.bad", Variant::Long(1))]));

        assert_eq!(
            results.get("a.bad"),
            Some(&WriteAttributeResult::Failed("rejected".to_string()))
        );
    }

    #[test]
    fn publish_skips_unset_binders() {
        let set = Arc::new(VariantBinder::new(Variant::Double(2.5)));
        let mut base = ChainItemBase::new();
        base.add_binder("a.set", set as _);
        base.add_binder("a.unset", Arc::new(VariantBinder::default()) as _);
        base.add_binder("a.failing", Arc::new(FailingBinder) as _);

        let mut attributes = Attributes::new();
        base.publish(&mut attributes);

        assert_eq!(attributes, attrs(&[("a.set", Variant::Double(2.5))]));
    }
}
