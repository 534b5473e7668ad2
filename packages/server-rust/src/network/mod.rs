//! Connection plumbing: outbound channel connections, inbound dispatch, and
//! long-running operation tracking.

pub mod connection;
pub mod dispatcher;
pub mod long_running;

pub use connection::*;
pub use dispatcher::*;
pub use long_running::*;
