//! GATT connection multiplexer D-Bus service
//!
//! This service shares one BLE GATT link per device among any number of
//! clients, connecting when the first client asks and disconnecting when
//! the last one lets go.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{
   signal,
   sync::{Notify, mpsc},
   time,
};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::{address::DeviceAddress, bluez::BluezDriver, driver};
use dbus::GattMuxService;
use event::{EventBus, LinkEvent};
use gatt::GattMultiplexer;

mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod gatt;

use crate::{dbus::GattMuxServiceSignals, error::Result};

const OBJECT_PATH: &str = "/org/gattmux/manager";

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting gattmuxd D-Bus service...");

   // Load configuration
   let config = config::Config::load()?;
   info!(
      "Loaded configuration with {} known devices",
      config.known_devices.len()
   );

   let event_bus = EventProcessor::new();

   // Driver completions are pumped back into the multiplexer
   let (driver_tx, driver_rx) = mpsc::unbounded_channel();
   let driver = Arc::new(BluezDriver::new(&config, driver_tx).await?);
   let mux = GattMultiplexer::with_events(driver, event_bus.clone());
   tokio::spawn(driver::pump(driver_rx, mux.clone()));

   let service = GattMuxService::new(mux.clone());
   for (addr, name) in config.known_addresses() {
      info!("Holding link to known device {name} ({addr})");
      service.hold(mux.connect(
         addr,
         move || info!("Known device {addr} connected"),
         move |code| warn!("Known device {addr} failed to connect: {code}"),
      ));
   }

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name("org.gattmux")?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("gattmuxd D-Bus service started at org.gattmux");

   // Start event processor
   event_bus.spawn_dispatcher(connection.clone()).await?;

   // Release handles of clients that vanish without disconnecting
   let iface = connection
      .object_server()
      .interface::<_, GattMuxService>(OBJECT_PATH)
      .await?;
   tokio::spawn(async move {
      if let Err(e) = dbus::watch_client_exits(connection, iface).await {
         warn!("Client exit watcher stopped: {e}");
      }
   });

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down gattmuxd...");

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<(DeviceAddress, LinkEvent)>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<(DeviceAddress, LinkEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<GattMuxService>,
      (address, event): (DeviceAddress, LinkEvent),
   ) -> Result<()> {
      let addr_str = address.to_string();
      match event {
         LinkEvent::Connected => {
            iface.link_connected(&addr_str).await?;
         },
         LinkEvent::Disconnected => {
            iface.link_disconnected(&addr_str).await?;
         },
         LinkEvent::ConnectFailed(code) => {
            iface.connect_failed(&addr_str, code.into()).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, GattMuxService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, address: DeviceAddress, event: LinkEvent) {
      self.queue.push((address, event));
      self.notifier.notify_waiters();
   }
}
