//! Link-level event notifications.
//!
//! The multiplexer reports physical link transitions here; the service
//! turns them into D-Bus signals.

use std::sync::Arc;

use crate::{bluetooth::address::DeviceAddress, error::ConnectErrorCode};

/// Events emitted when a link changes state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
   Connected,
   Disconnected,
   ConnectFailed(ConnectErrorCode),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, address: DeviceAddress, event: LinkEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
