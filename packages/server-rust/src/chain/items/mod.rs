//! Stock chain stages.

pub mod inject;
pub mod scale;
pub mod sum_error;

pub use inject::{
    InjectChainItem, ATTR_CHAIN_INPUT_ADD, ATTR_CHAIN_INPUT_REMOVE, ATTR_CHAIN_OUTPUT_ADD,
    ATTR_CHAIN_OUTPUT_REMOVE, ATTR_CHAIN_VALUE, INJECT_TAG,
};
pub use scale::{ScaleChainItem, SCALE_TAG};
pub use sum_error::{SumErrorChainItem, SUM_ERROR_TAG};
