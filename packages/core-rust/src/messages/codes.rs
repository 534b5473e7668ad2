//! Command codes understood by the core.
//!
//! Generic codes live in the `0x0000_xxxx` range, data-access codes in
//! `0x0001_xxxx`.

pub const CC_UNKNOWN_COMMAND_CODE: u32 = 0x0000_0001;
pub const CC_FAILED: u32 = 0x0000_0002;
pub const CC_ACK: u32 = 0x0000_0003;

pub const CC_CREATE_SESSION: u32 = 0x0001_0001;
pub const CC_CLOSE_SESSION: u32 = 0x0001_0002;

pub const CC_SUBSCRIBE_ITEM: u32 = 0x0001_0010;
pub const CC_UNSUBSCRIBE_ITEM: u32 = 0x0001_0011;
pub const CC_NOTIFY_VALUE: u32 = 0x0001_0020;
pub const CC_NOTIFY_ATTRIBUTES: u32 = 0x0001_0021;

pub const CC_WRITE_OPERATION: u32 = 0x0001_0030;
pub const CC_WRITE_OPERATION_RESULT: u32 = 0x0001_0031;
pub const CC_WRITE_ATTRIBUTES_OPERATION: u32 = 0x0001_0032;
pub const CC_WRITE_ATTRIBUTES_OPERATION_RESULT: u32 = 0x0001_0033;

pub const CC_ENUM_SUBSCRIBE: u32 = 0x0001_0040;
pub const CC_ENUM_UNSUBSCRIBE: u32 = 0x0001_0041;
pub const CC_ENUM_EVENT: u32 = 0x0001_0042;

/// Cancels a running long-running operation identified by its `"id"` field.
pub const CC_CANCEL_OPERATION: u32 = 0x0001_0050;
