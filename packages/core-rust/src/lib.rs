//! `datahive` core: variants, transport messages, and the subscription engine.

pub mod messages;
pub mod subscription;
pub mod types;

pub use messages::{codes, CodecError, EnumChange, Message, MessageValue};
pub use subscription::{
    ListenerKey, Subscription, SubscriptionInformation, SubscriptionListener, SubscriptionSource,
    SubscriptionState,
};
pub use types::{Attributes, IoDirection, IoDirections, Variant};
