use std::sync::{Arc, Weak};

use datahive_core::{Attributes, IoDirection, Variant};

use crate::chain::chained_item::ChainedItem;
use crate::chain::item::{AttributeBinder, ChainItem, ChainItemBase, WriteAttributeResults};

pub const INJECT_TAG: &str = "chain.inject";

/// Published chain composition, e.g. `"chain.inject([INPUT]), scale([OUTPUT])"`.
pub const ATTR_CHAIN_VALUE: &str = "chain.value";
pub const ATTR_CHAIN_INPUT_ADD: &str = "chain.input.add";
pub const ATTR_CHAIN_INPUT_REMOVE: &str = "chain.input.remove";
pub const ATTR_CHAIN_OUTPUT_ADD: &str = "chain.output.add";
pub const ATTR_CHAIN_OUTPUT_REMOVE: &str = "chain.output.remove";

#[derive(Debug, Clone, Copy)]
enum ChainAction {
    Add,
    Remove,
}

/// Adds or removes a stage by tag when its attribute is written.
struct ChainBinder {
    item: Weak<ChainedItem>,
    direction: IoDirection,
    action: ChainAction,
}

impl AttributeBinder for ChainBinder {
    fn bind(&self, value: &Variant) -> anyhow::Result<()> {
        let Some(tag) = value.as_string() else {
            return Ok(());
        };
        let item = self
            .item
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("data item is gone"))?;
        match self.action {
            ChainAction::Add => item.add_chain_element_by_type(self.direction.into(), &tag)?,
            ChainAction::Remove => item.remove_chain_element(self.direction, &tag)?,
        }
        Ok(())
    }
}

/// Built-in first stage of every item's input chain.
///
/// Mirrors the chain composition into `chain.value` and owns the
/// `chain.{input,output}.{add,remove}` binders.
pub struct InjectChainItem {
    base: ChainItemBase,
    item: Weak<ChainedItem>,
}

impl InjectChainItem {
    pub(crate) fn new(item: &Weak<ChainedItem>) -> Self {
        let binder = |direction, action| -> Arc<dyn AttributeBinder> {
            Arc::new(ChainBinder {
                item: Weak::clone(item),
                direction,
                action,
            })
        };

        let mut base = ChainItemBase::new();
        base.add_binder(ATTR_CHAIN_INPUT_ADD, binder(IoDirection::Input, ChainAction::Add));
        base.add_binder(ATTR_CHAIN_INPUT_REMOVE, binder(IoDirection::Input, ChainAction::Remove));
        base.add_binder(ATTR_CHAIN_OUTPUT_ADD, binder(IoDirection::Output, ChainAction::Add));
        base.add_binder(ATTR_CHAIN_OUTPUT_REMOVE, binder(IoDirection::Output, ChainAction::Remove));
        base.set_reserved_attributes([ATTR_CHAIN_VALUE]);

        Self {
            base,
            item: Weak::clone(item),
        }
    }
}

impl ChainItem for InjectChainItem {
    fn type_name(&self) -> &str {
        INJECT_TAG
    }

    fn process(&self, _value: &Variant, attributes: &mut Attributes) -> anyhow::Result<Option<Variant>> {
        if let Some(item) = self.item.upgrade() {
            let composition = item
                .chain_copy()
                .iter()
                .map(|entry| format!("{}({})", entry.stage.type_name(), entry.directions))
                .collect::<Vec<_>>()
                .join(", ");
            attributes.insert(ATTR_CHAIN_VALUE.to_string(), Variant::String(composition));
        }
        Ok(None)
    }

    fn set_attributes(&self, attributes: &Attributes) -> WriteAttributeResults {
        self.base.set_attributes(attributes)
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for InjectChainItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectChainItem")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}
