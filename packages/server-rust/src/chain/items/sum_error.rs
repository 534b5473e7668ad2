use datahive_core::{Attributes, Variant};
use regex::Regex;

use crate::chain::item::ChainItem;

pub const SUM_ERROR_TAG: &str = "sum-error";

pub const ATTR_ERROR: &str = "error";
pub const ATTR_ERROR_COUNT: &str = "error.count";
pub const ATTR_ERROR_ITEMS: &str = "error.items";

/// Folds every truthy `*.error` attribute into one item-level error flag.
#[derive(Debug)]
pub struct SumErrorChainItem {
    pattern: Regex,
}

impl SumErrorChainItem {
    /// # Errors
    ///
    /// Returns an error if the error-key pattern fails to compile.
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            pattern: Regex::new(r"\.error$")?,
        })
    }
}

impl ChainItem for SumErrorChainItem {
    fn type_name(&self) -> &str {
        SUM_ERROR_TAG
    }

    fn process(&self, _value: &Variant, attributes: &mut Attributes) -> anyhow::Result<Option<Variant>> {
        let flagged: Vec<&str> = attributes
            .iter()
            .filter(|(key, value)| self.pattern.is_match(key) && value.as_bool())
            .map(|(key, _)| key.as_str())
            .collect();

        let count = i64::try_from(flagged.len())?;
        let items = flagged.join(", ");
        attributes.insert(ATTR_ERROR.to_string(), Variant::Bool(count > 0));
        attributes.insert(ATTR_ERROR_COUNT.to_string(), Variant::Long(count));
        attributes.insert(ATTR_ERROR_ITEMS.to_string(), Variant::String(items));
        Ok(None)
    }

    fn is_persistent(&self) -> bool {
        false
    }
}
