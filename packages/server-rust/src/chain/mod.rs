//! Chained item pipeline: data items whose published value and attributes
//! are computed by an ordered, runtime-configurable list of stages.

pub mod chained_item;
pub mod item;
pub mod items;
pub mod registry;

pub use chained_item::{
    ChainError, ChainProcessEntry, ChainedItem, ItemListener, WriteError, WriteHandler,
};
pub use item::{
    AttributeBinder, ChainItem, ChainItemBase, VariantBinder, WriteAttributeResult,
    WriteAttributeResults,
};
pub use registry::{ChainItemFactory, ChainItemRegistry};
