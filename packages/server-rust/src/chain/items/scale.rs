use std::sync::Arc;

use anyhow::Context;
use datahive_core::{Attributes, Variant};

use crate::chain::item::{ChainItem, ChainItemBase, VariantBinder, WriteAttributeResults};

pub const SCALE_TAG: &str = "scale";

pub const ATTR_SCALE_ACTIVE: &str = "scale.active";
pub const ATTR_SCALE_FACTOR: &str = "scale.factor";
pub const ATTR_SCALE_OFFSET: &str = "scale.offset";
pub const ATTR_SCALE_RAW: &str = "scale.raw";

/// Linear scaling `value * factor + offset`, configured through attributes.
///
/// Inactive by default. While active the unscaled value is published as
/// `scale.raw`.
#[derive(Debug)]
pub struct ScaleChainItem {
    base: ChainItemBase,
    active: Arc<VariantBinder>,
    factor: Arc<VariantBinder>,
    offset: Arc<VariantBinder>,
}

impl ScaleChainItem {
    #[must_use]
    pub fn new() -> Self {
        let active = Arc::new(VariantBinder::new(Variant::Bool(false)));
        let factor = Arc::new(VariantBinder::new(Variant::Double(1.0)));
        let offset = Arc::new(VariantBinder::new(Variant::Double(0.0)));

        let mut base = ChainItemBase::new();
        base.add_binder(ATTR_SCALE_ACTIVE, Arc::clone(&active) as _);
        base.add_binder(ATTR_SCALE_FACTOR, Arc::clone(&factor) as _);
        base.add_binder(ATTR_SCALE_OFFSET, Arc::clone(&offset) as _);
        base.set_reserved_attributes([ATTR_SCALE_RAW]);

        Self {
            base,
            active,
            factor,
            offset,
        }
    }
}

impl Default for ScaleChainItem {
    fn default() -> Self {
        Self::new()
    }
}

fn number(binder: &VariantBinder, key: &str) -> anyhow::Result<f64> {
    let value = binder.value();
    value
        .as_double()
        .with_context(|| format!("{key} is not numeric: {value}"))
}

impl ChainItem for ScaleChainItem {
    fn type_name(&self) -> &str {
        SCALE_TAG
    }

    fn process(&self, value: &Variant, attributes: &mut Attributes) -> anyhow::Result<Option<Variant>> {
        self.base.publish(attributes);
        if !self.active.value().as_bool() || value.is_null() {
            return Ok(None);
        }

        let raw = value
            .as_double()
            .with_context(|| format!("cannot scale non-numeric value {value}"))?;
        let factor = number(&self.factor, ATTR_SCALE_FACTOR)?;
        let offset = number(&self.offset, ATTR_SCALE_OFFSET)?;

        attributes.insert(ATTR_SCALE_RAW.to_string(), value.clone());
        Ok(Some(Variant::Double(raw.mul_add(factor, offset))))
    }

    fn set_attributes(&self, attributes: &Attributes) -> WriteAttributeResults {
        self.base.set_attributes(attributes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::item::WriteAttributeResult;

    fn configure(stage: &ScaleChainItem, pairs: &[(&str, Variant)]) -> WriteAttributeResults {
        let attributes: Attributes = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        stage.set_attributes(&attributes)
    }

    #[test]
    fn inactive_stage_passes_value_through() {
        let stage = ScaleChainItem::new();
        let mut attributes = Attributes::new();

        let out = stage.process(&Variant::Long(10), &mut attributes).unwrap();

        assert_eq!(out, None);
        assert_eq!(attributes[ATTR_SCALE_ACTIVE], Variant::Bool(false));
        assert_eq!(attributes[ATTR_SCALE_FACTOR], Variant::Double(1.0));
        assert!(!attributes.contains_key(ATTR_SCALE_RAW));
    }

    #[test]
    fn active_stage_scales_and_keeps_raw() {
        let stage = ScaleChainItem::new();
        let results = configure(
            &stage,
            &[
                (ATTR_SCALE_ACTIVE, Variant::Bool(true)),
                (ATTR_SCALE_FACTOR, Variant::Double(2.0)),
                (ATTR_SCALE_OFFSET, Variant::Long(1)),
            ],
        );
        assert!(results.values().all(WriteAttributeResult::is_ok));

        let mut attributes = Attributes::new();
        let out = stage.process(&Variant::Int(10), &mut attributes).unwrap();

        assert_eq!(out, Some(Variant::Double(21.0)));
        assert_eq!(attributes[ATTR_SCALE_RAW], Variant::Int(10));
    }

    #[test]
    fn raw_attribute_is_reserved() {
        let stage = ScaleChainItem::new();
        let results = configure(&stage, &[(ATTR_SCALE_RAW, Variant::Long(3))]);
        assert_eq!(results[ATTR_SCALE_RAW], WriteAttributeResult::Reserved);
    }

    #[test]
    fn non_numeric_value_is_an_error() {
        let stage = ScaleChainItem::new();
        configure(&stage, &[(ATTR_SCALE_ACTIVE, Variant::Bool(true))]);

        let err = stage
            .process(&Variant::from("high"), &mut Attributes::new())
            .unwrap_err();
        assert!(err.to_string().contains("non-numeric"));
    }
}
