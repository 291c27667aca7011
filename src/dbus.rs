use std::{
   collections::HashMap,
   sync::atomic::{AtomicU64, Ordering},
};

use futures::StreamExt;
use log::{debug, info};
use parking_lot::Mutex;
use zbus::{
   Connection,
   fdo::DBusProxy,
   interface,
   message::Header,
   object_server::{InterfaceRef, SignalEmitter},
};

use crate::{
   bluetooth::address::{self, DeviceAddress},
   gatt::{ConnectionHandle, GattMultiplexer},
};

/// A handle kept alive for a client, released when its owner leaves the bus.
struct HeldHandle {
   handle: ConnectionHandle,
   owner: Option<String>,
}

/// Holds connection handles on behalf of D-Bus clients.
pub struct GattMuxService {
   mux: GattMultiplexer,
   handles: Mutex<HashMap<u64, HeldHandle>>,
   next_id: AtomicU64,
}

impl GattMuxService {
   pub fn new(mux: GattMultiplexer) -> Self {
      Self {
         mux,
         handles: Mutex::new(HashMap::new()),
         next_id: AtomicU64::new(1),
      }
   }

   /// Keeps `handle` alive until a client disconnects it; returns its id.
   pub fn hold(&self, handle: ConnectionHandle) -> u64 {
      self.hold_for(handle, None)
   }

   fn hold_for(&self, handle: ConnectionHandle, owner: Option<String>) -> u64 {
      let id = self.next_id.fetch_add(1, Ordering::Relaxed);
      self.handles.lock().insert(id, HeldHandle { handle, owner });
      id
   }

   /// Drops every handle held for `owner`. Returns how many were dropped.
   pub fn release_owner(&self, owner: &str) -> usize {
      let released: Vec<HeldHandle> = {
         let mut handles = self.handles.lock();
         let ids: Vec<u64> = handles
            .iter()
            .filter(|(_, held)| held.owner.as_deref() == Some(owner))
            .map(|(id, _)| *id)
            .collect();
         ids.iter().filter_map(|id| handles.remove(id)).collect()
      };
      released.len()
   }

   fn with_handle<T>(
      &self,
      id: u64,
      f: impl FnOnce(&ConnectionHandle) -> T,
   ) -> zbus::fdo::Result<T> {
      self
         .handles
         .lock()
         .get(&id)
         .map(|held| f(&held.handle))
         .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("Unknown handle: {id}")))
   }
}

/// Releases the handles of clients that leave the bus without
/// disconnecting them.
pub async fn watch_client_exits(
   connection: Connection,
   iface: InterfaceRef<GattMuxService>,
) -> zbus::Result<()> {
   let proxy = DBusProxy::new(&connection).await?;
   let mut changes = proxy.receive_name_owner_changed().await?;

   while let Some(signal) = changes.next().await {
      let args = signal.args()?;
      if args.new_owner().is_some() {
         continue;
      }
      let name = args.name().to_string();
      let released = iface.get().await.release_owner(&name);
      if released > 0 {
         info!("Client {name} left the bus, released {released} handle(s)");
      } else {
         debug!("{name} left the bus");
      }
   }
   Ok(())
}

fn parse_address(address: &str) -> zbus::fdo::Result<DeviceAddress> {
   address
      .parse()
      .map_err(|e: crate::error::GattMuxError| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

#[interface(name = "org.gattmux.Manager")]
impl GattMuxService {
   /// Returns the canonical form of `address`, or an empty string.
   async fn canonicalize_address(&self, address: String) -> String {
      address::canonicalize_address(&address)
   }

   async fn connect(
      &self,
      #[zbus(header)] header: Header<'_>,
      address: String,
   ) -> zbus::fdo::Result<u64> {
      let addr = parse_address(&address)?;
      let owner = header.sender().map(ToString::to_string);

      let handle = self
         .mux
         .connect_async(addr)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      let id = self.hold_for(handle, owner);
      info!("Handle {id} connected to {addr}");
      Ok(id)
   }

   async fn disconnect(&self, handle: u64) -> zbus::fdo::Result<bool> {
      let held = self
         .handles
         .lock()
         .remove(&handle)
         .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("Unknown handle: {handle}")))?;
      held.handle.disconnect();
      Ok(true)
   }

   async fn is_connected(&self, handle: u64) -> zbus::fdo::Result<bool> {
      self.with_handle(handle, ConnectionHandle::is_connected)
   }

   async fn device_address(&self, handle: u64) -> zbus::fdo::Result<String> {
      self.with_handle(handle, |h| h.device_address().to_string())
   }

   async fn disconnect_device(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      Ok(self.mux.disconnect_device(addr))
   }

   async fn link_state(&self, address: String) -> zbus::fdo::Result<String> {
      let addr = parse_address(&address)?;
      let phase: &'static str = self.mux.link_phase(addr).into();
      Ok(phase.to_string())
   }

   async fn get_links(&self) -> zbus::fdo::Result<String> {
      let links: Vec<serde_json::Value> = self.mux.links().iter().map(|l| l.to_json()).collect();
      serde_json::to_string(&links).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   // Signals
   #[zbus(signal)]
   pub async fn link_connected(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn link_disconnected(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn connect_failed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      error: &str,
   ) -> zbus::Result<()>;

   #[zbus(property)]
   async fn handle_count(&self) -> u32 {
      u32::try_from(self.handles.lock().len()).unwrap_or(u32::MAX)
   }
}
