//! The platform GATT driver seam.
//!
//! The multiplexer never talks to hardware itself. It asks a [`GattDriver`]
//! to start or tear down a link and learns the outcome later through
//! [`DriverEvent`]s, which [`pump`] feeds back into the multiplexer.

use std::sync::Arc;

use log::debug;
use tokio::sync::mpsc;

use crate::{bluetooth::address::DeviceAddress, error::ConnectErrorCode, gatt::GattMultiplexer};

/// Platform-level link control. Both requests are fire-and-forget.
pub trait GattDriver: Send + Sync {
   /// Starts a GATT link to `address`. The outcome must later be reported
   /// as [`DriverEvent::ConnectCompleted`].
   fn connect(&self, address: DeviceAddress);

   /// Tears down the link to `address`. Completion must later be reported
   /// as [`DriverEvent::DisconnectCompleted`].
   fn disconnect(&self, address: DeviceAddress);
}

/// Type alias for a shared driver.
pub type DriverRef = Arc<dyn GattDriver>;

/// Completion notifications flowing from the driver to the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
   ConnectCompleted(DeviceAddress, Result<(), ConnectErrorCode>),
   DisconnectCompleted(DeviceAddress),
   DeviceRemoved(DeviceAddress),
}

pub type DriverEventSender = mpsc::UnboundedSender<DriverEvent>;
pub type DriverEventReceiver = mpsc::UnboundedReceiver<DriverEvent>;

/// Delivers driver completions to the multiplexer until every sender is
/// gone.
pub async fn pump(mut rx: DriverEventReceiver, mux: GattMultiplexer) {
   while let Some(event) = rx.recv().await {
      debug!("Driver event: {event:?}");
      match event {
         DriverEvent::ConnectCompleted(addr, result) => mux.on_connect_completed(addr, result),
         DriverEvent::DisconnectCompleted(addr) => mux.on_disconnect_completed(addr),
         DriverEvent::DeviceRemoved(addr) => mux.remove_device(addr),
      }
   }
   debug!("Driver event pump stopped");
}
