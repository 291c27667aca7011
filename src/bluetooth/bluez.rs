//! BlueZ implementation of the GATT driver.
//!
//! Requests are carried out on spawned tasks and their outcomes are sent
//! back as [`DriverEvent`]s. The driver also watches each established link
//! for drops it did not ask for, and the adapter for removed devices.

use std::{collections::HashMap, pin::pin, sync::Arc, time::Duration};

use bluer::{Adapter, AdapterEvent, Device, DeviceEvent, DeviceProperty, ErrorKind, Session};
use futures::stream::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{runtime::Handle, task::JoinHandle, time};

use crate::{
   bluetooth::{
      address::DeviceAddress,
      driver::{DriverEvent, DriverEventSender, GattDriver},
   },
   config::Config,
   error::{ConnectErrorCode, GattMuxError, Result},
};

type Watchers = Arc<Mutex<HashMap<DeviceAddress, JoinHandle<()>>>>;

/// GATT driver backed by the system `bluetoothd`.
pub struct BluezDriver {
   _session: Session,
   adapter: Adapter,
   runtime: Handle,
   events: DriverEventSender,
   connect_timeout: Duration,
   watchers: Watchers,
   monitor: JoinHandle<()>,
}

impl BluezDriver {
   /// Opens the configured adapter (or the default one) and starts
   /// monitoring it.
   pub async fn new(config: &Config, events: DriverEventSender) -> Result<Self> {
      let session = Session::new().await?;

      let adapter = match &config.adapter {
         Some(name) => {
            if !session.adapter_names().await?.iter().any(|n| n == name.as_str()) {
               return Err(GattMuxError::AdapterNotFound);
            }
            session.adapter(name)?
         },
         None => session.default_adapter().await?,
      };

      if !adapter.is_powered().await? {
         adapter.set_powered(true).await?;
         info!("Powered on adapter: {}", adapter.name());
      }
      info!("Using adapter: {}", adapter.name());

      let monitor = Self::start_adapter_monitor(events.clone(), adapter.clone());
      Ok(Self {
         _session: session,
         adapter,
         runtime: Handle::current(),
         events,
         connect_timeout: config.connect_timeout(),
         watchers: Arc::default(),
         monitor,
      })
   }

   fn start_adapter_monitor(events: DriverEventSender, adapter: Adapter) -> JoinHandle<()> {
      tokio::spawn(async move {
         let name = adapter.name().to_string();
         let Ok(mut stream) = adapter.events().await else {
            warn!("Failed to get adapter events for {name}");
            return;
         };

         while let Some(event) = stream.next().await {
            if let AdapterEvent::DeviceRemoved(addr) = event {
               debug!("Device removed on {name}: {addr}");
               if events.send(DriverEvent::DeviceRemoved(addr.into())).is_err() {
                  return;
               }
            }
         }
         warn!("Adapter {name} event stream ended");
      })
   }

   async fn establish(
      adapter: &Adapter,
      address: DeviceAddress,
      timeout: Duration,
   ) -> std::result::Result<Device, ConnectErrorCode> {
      let device = adapter.device(address.into()).map_err(|e| {
         warn!("Device {address} unavailable: {e}");
         ConnectErrorCode::from_bluer(&e)
      })?;

      match time::timeout(timeout, device.connect()).await {
         Ok(Ok(())) => Ok(device),
         Ok(Err(e)) if matches!(e.kind, ErrorKind::AlreadyConnected) => Ok(device),
         Ok(Err(e)) => {
            warn!("Failed to connect to {address}: {e}");
            Err(ConnectErrorCode::from_bluer(&e))
         },
         Err(_) => {
            warn!("Connection to {address} timed out");
            Err(ConnectErrorCode::Failed)
         },
      }
   }

   /// Reports the link as down once BlueZ says the device disconnected.
   fn watch_link(
      device: Device,
      address: DeviceAddress,
      events: DriverEventSender,
   ) -> JoinHandle<()> {
      tokio::spawn(async move {
         let Ok(stream) = device.events().await else {
            warn!("Failed to get device events for {address}");
            return;
         };
         let mut stream = pin!(stream);

         while let Some(event) = stream.next().await {
            if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
               info!("{address} dropped the link");
               let _ = events.send(DriverEvent::DisconnectCompleted(address));
               return;
            }
         }
      })
   }
}

/// Registers the link watcher, then reports the connect. A disconnect
/// requested in reaction to the report must find the watcher to abort it.
fn report_connected(
   watchers: &Watchers,
   events: &DriverEventSender,
   address: DeviceAddress,
   watcher: JoinHandle<()>,
) {
   if let Some(old) = watchers.lock().insert(address, watcher) {
      old.abort();
   }
   let _ = events.send(DriverEvent::ConnectCompleted(address, Ok(())));
}

impl GattDriver for BluezDriver {
   fn connect(&self, address: DeviceAddress) {
      let adapter = self.adapter.clone();
      let events = self.events.clone();
      let watchers = self.watchers.clone();
      let timeout = self.connect_timeout;

      self.runtime.spawn(async move {
         debug!("Connecting to {address}");
         match Self::establish(&adapter, address, timeout).await {
            Ok(device) => {
               let watcher = Self::watch_link(device, address, events.clone());
               report_connected(&watchers, &events, address, watcher);
            },
            Err(code) => {
               let _ = events.send(DriverEvent::ConnectCompleted(address, Err(code)));
            },
         }
      });
   }

   fn disconnect(&self, address: DeviceAddress) {
      if let Some(watcher) = self.watchers.lock().remove(&address) {
         watcher.abort();
      }

      let adapter = self.adapter.clone();
      let events = self.events.clone();
      self.runtime.spawn(async move {
         debug!("Disconnecting from {address}");
         match adapter.device(address.into()) {
            Ok(device) => {
               if let Err(e) = device.disconnect().await {
                  warn!("Failed to disconnect from {address}: {e}");
               }
            },
            Err(e) => warn!("Device {address} unavailable: {e}"),
         }
         let _ = events.send(DriverEvent::DisconnectCompleted(address));
      });
   }
}

impl Drop for BluezDriver {
   fn drop(&mut self) {
      self.monitor.abort();
      for (_, watcher) in self.watchers.lock().drain() {
         watcher.abort();
      }
   }
}
