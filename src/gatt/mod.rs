//! GATT connection multiplexing.
//!
//! This module lets many independent [`ConnectionHandle`]s share the single
//! GATT link a device offers.

pub mod handle;
pub mod link;
pub mod multiplexer;

pub use handle::ConnectionHandle;
pub use multiplexer::GattMultiplexer;
