//! Caller-held connection handles.

use core::fmt;
use std::sync::{
   Weak,
   atomic::{AtomicBool, Ordering},
};

use crate::{bluetooth::address::DeviceAddress, gatt::multiplexer::MuxInner};

/// Token representing one caller's interest in a device's GATT link.
///
/// Handles share the link with every other handle for the same address.
/// Dropping a handle disconnects it if its owner has not already done so.
pub struct ConnectionHandle {
   address: DeviceAddress,
   session: u64,
   mux: Weak<MuxInner>,
   disconnected: AtomicBool,
}

impl ConnectionHandle {
   pub(crate) fn new(address: DeviceAddress, session: u64, mux: Weak<MuxInner>) -> Self {
      Self {
         address,
         session,
         mux,
         disconnected: AtomicBool::new(false),
      }
   }

   /// Address of the device this handle refers to. Stays valid after the
   /// device or its link is gone.
   pub const fn device_address(&self) -> DeviceAddress {
      self.address
   }

   /// Whether this handle currently has a usable link.
   ///
   /// Once a handle has disconnected, or its link went down, it never
   /// reports connected again.
   pub fn is_connected(&self) -> bool {
      if self.disconnected.load(Ordering::Acquire) {
         return false;
      }
      self
         .mux
         .upgrade()
         .is_some_and(|mux| mux.is_session_connected(self.address, self.session))
   }

   /// Withdraws this handle's interest in the link. Idempotent.
   pub fn disconnect(&self) {
      if self.disconnected.swap(true, Ordering::AcqRel) {
         return;
      }
      if let Some(mux) = self.mux.upgrade() {
         mux.release(self.address, self.session);
      }
   }
}

impl Drop for ConnectionHandle {
   fn drop(&mut self) {
      self.disconnect();
   }
}

impl fmt::Debug for ConnectionHandle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("ConnectionHandle")
         .field("address", &self.address)
         .field("session", &self.session)
         .field("disconnected", &self.disconnected.load(Ordering::Relaxed))
         .finish()
   }
}
