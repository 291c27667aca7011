//! GATT connection multiplexer.
//!
//! Any number of [`ConnectionHandle`]s may ask for a link to the same
//! device, while the platform offers one physical link per address. The
//! multiplexer coalesces their requests into a single platform connect,
//! fans the outcome out to every waiter exactly once, and tears the link
//! down when the last interested handle is gone.
//!
//! All link state lives behind one registry lock. Driver requests, user
//! continuations and events run only after the lock is released, so any of
//! them may call back into the multiplexer.

use std::{
   collections::HashMap,
   mem,
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use smallvec::{SmallVec, smallvec};
use tokio::sync::oneshot;

use crate::{
   bluetooth::{address::DeviceAddress, driver::DriverRef},
   error::{ConnectErrorCode, GattMuxError, Result},
   event::{EventSender, LinkEvent},
   gatt::{
      handle::ConnectionHandle,
      link::{ConnectCallback, Deferred, Link, LinkPhase, LinkSnapshot, Outcome},
   },
};

type Callbacks = SmallVec<[ConnectCallback; 2]>;

/// Side effects decided under the registry lock and carried out after it
/// is released.
struct Effects {
   connect: bool,
   disconnect: bool,
   callbacks: Callbacks,
   outcome: Outcome,
   event: Option<LinkEvent>,
}

impl Effects {
   fn new() -> Self {
      Self {
         connect: false,
         disconnect: false,
         callbacks: SmallVec::new(),
         outcome: Ok(()),
         event: None,
      }
   }

   fn fan_out(&mut self, callbacks: Callbacks, outcome: Outcome) {
      self.callbacks = callbacks;
      self.outcome = outcome;
   }

   fn apply(self, inner: &MuxInner, address: DeviceAddress) {
      if self.connect {
         debug!("Requesting platform connect to {address}");
         inner.driver.connect(address);
      }
      for callback in self.callbacks {
         callback(self.outcome);
      }
      if self.disconnect {
         debug!("Requesting platform disconnect from {address}");
         inner.driver.disconnect(address);
      }
      if let (Some(event), Some(events)) = (self.event, &inner.events) {
         events.emit(address, event);
      }
   }
}

pub(crate) struct MuxInner {
   driver: DriverRef,
   events: Option<EventSender>,
   links: Mutex<HashMap<DeviceAddress, Link>>,
   next_session: AtomicU64,
}

impl MuxInner {
   fn next_session(&self) -> u64 {
      self.next_session.fetch_add(1, Ordering::Relaxed)
   }

   fn connect(
      self: &Arc<Self>,
      address: DeviceAddress,
      callback: ConnectCallback,
   ) -> ConnectionHandle {
      let mut effects = Effects::new();
      let session = {
         let mut links = self.links.lock();
         let link = links
            .entry(address)
            .or_insert_with(|| Link::new(self.next_session()));

         if link.gatt_connected {
            // Also taken while a disconnect is outstanding: the link is
            // assumed usable until the platform reports it down.
            debug!("{address}: link already up, joining");
            link.interest += 1;
            effects.fan_out(smallvec![callback], Ok(()));
            link.session
         } else if link.disconnect_in_flight {
            // A completion arriving now belongs to the disconnect, so the
            // attempt waits until the link is down.
            let deferred = link
               .deferred
               .get_or_insert_with(|| Deferred::new(self.next_session()));
            deferred.interest += 1;
            deferred.callbacks.push(callback);
            debug!("{address}: connect deferred until disconnect completes");
            deferred.session
         } else {
            link.interest += 1;
            link.pending.push(callback);
            if link.connect_in_flight {
               debug!("{address}: joining in-flight connect ({} waiting)", link.pending.len());
            } else {
               link.connect_in_flight = true;
               link.last_error = None;
               effects.connect = true;
            }
            link.session
         }
      };

      let handle = ConnectionHandle::new(address, session, Arc::downgrade(self));
      effects.apply(self, address);
      handle
   }

   pub(crate) fn release(&self, address: DeviceAddress, session: u64) {
      let mut effects = Effects::new();
      {
         let mut links = self.links.lock();
         let Some(link) = links.get_mut(&address) else {
            return;
         };
         if link.session != session {
            match link.deferred.as_mut().filter(|d| d.session == session) {
               Some(deferred) => deferred.interest = deferred.interest.saturating_sub(1),
               None => debug!("{address}: released handle belongs to a closed session"),
            }
            return;
         }

         link.interest = link.interest.saturating_sub(1);
         if link.wants_disconnect(false) {
            info!("{address}: no interested handles left, disconnecting");
            link.disconnect_in_flight = true;
            effects.disconnect = true;
         }
         if link.is_reapable() {
            links.remove(&address);
         }
      }
      effects.apply(self, address);
   }

   pub(crate) fn is_session_connected(&self, address: DeviceAddress, session: u64) -> bool {
      self
         .links
         .lock()
         .get(&address)
         .is_some_and(|link| link.session == session && link.gatt_connected)
   }

   fn disconnect_device(&self, address: DeviceAddress) -> bool {
      let mut effects = Effects::new();
      {
         let mut links = self.links.lock();
         let Some(link) = links.get_mut(&address) else {
            return false;
         };
         if !link.wants_disconnect(true) {
            return false;
         }
         info!("{address}: disconnect requested for all handles");
         link.disconnect_in_flight = true;
         effects.disconnect = true;
      }
      effects.apply(self, address);
      true
   }

   fn on_connect_completed(&self, address: DeviceAddress, result: Outcome) {
      let mut effects = Effects::new();
      {
         let mut links = self.links.lock();
         let Some(link) = links.get_mut(&address) else {
            debug!("{address}: ignoring connect completion for unknown link");
            return;
         };
         if !link.connect_in_flight {
            debug!("{address}: ignoring duplicate connect completion");
            return;
         }

         link.connect_in_flight = false;
         let callbacks = mem::take(&mut link.pending);
         match result {
            Ok(()) => {
               info!("{address}: GATT link up, notifying {} requester(s)", callbacks.len());
               link.gatt_connected = true;
               effects.event = Some(LinkEvent::Connected);
               if link.wants_disconnect(false) {
                  link.disconnect_in_flight = true;
                  effects.disconnect = true;
               }
            },
            Err(code) => {
               warn!("{address}: GATT connect failed: {code}");
               link.last_error = Some(code);
               link.reset_session(self.next_session());
               effects.event = Some(LinkEvent::ConnectFailed(code));
            },
         }
         effects.fan_out(callbacks, result);

         if link.is_reapable() {
            links.remove(&address);
         }
      }
      effects.apply(self, address);
   }

   fn on_disconnect_completed(&self, address: DeviceAddress) {
      let mut effects = Effects::new();
      {
         let mut links = self.links.lock();
         let Some(link) = links.get_mut(&address) else {
            debug!("{address}: ignoring disconnect completion for unknown link");
            return;
         };

         let was_connected = mem::replace(&mut link.gatt_connected, false);
         link.disconnect_in_flight = false;
         if link.connect_in_flight {
            // The link went down before it ever came up; that settles the
            // outstanding attempt.
            link.connect_in_flight = false;
            link.last_error = Some(ConnectErrorCode::Failed);
            effects.fan_out(mem::take(&mut link.pending), Err(ConnectErrorCode::Failed));
            effects.event = Some(LinkEvent::ConnectFailed(ConnectErrorCode::Failed));
            warn!("{address}: disconnected while connecting");
         } else if was_connected {
            info!("{address}: GATT link down");
            effects.event = Some(LinkEvent::Disconnected);
         }
         link.reset_session(self.next_session());

         if let Some(deferred) = link.deferred.take() {
            info!(
               "{address}: starting deferred connect for {} requester(s)",
               deferred.callbacks.len()
            );
            link.session = deferred.session;
            link.interest = deferred.interest;
            link.pending = deferred.callbacks;
            link.connect_in_flight = true;
            link.last_error = None;
            effects.connect = true;
         }

         if link.is_reapable() {
            links.remove(&address);
         }
      }
      effects.apply(self, address);
   }

   fn remove_device(&self, address: DeviceAddress) {
      let mut effects = Effects::new();
      {
         let Some(mut link) = self.links.lock().remove(&address) else {
            return;
         };
         info!("{address}: device removed");

         let mut callbacks = mem::take(&mut link.pending);
         if let Some(deferred) = link.deferred.take() {
            callbacks.extend(deferred.callbacks);
         }

         effects.disconnect = link.wants_disconnect(true);
         if link.gatt_connected {
            effects.event = Some(LinkEvent::Disconnected);
         } else if !callbacks.is_empty() {
            effects.event = Some(LinkEvent::ConnectFailed(ConnectErrorCode::Failed));
         }
         effects.fan_out(callbacks, Err(ConnectErrorCode::Failed));
      }
      effects.apply(self, address);
   }
}

/// Shares one GATT link per device among any number of connection handles.
///
/// This type is cheaply cloneable and thread-safe.
#[derive(Clone)]
pub struct GattMultiplexer(Arc<MuxInner>);

impl GattMultiplexer {
   pub fn new(driver: DriverRef) -> Self {
      Self::build(driver, None)
   }

   /// Creates a multiplexer that reports link transitions to `events`.
   pub fn with_events(driver: DriverRef, events: EventSender) -> Self {
      Self::build(driver, Some(events))
   }

   fn build(driver: DriverRef, events: Option<EventSender>) -> Self {
      Self(Arc::new(MuxInner {
         driver,
         events,
         links: Mutex::new(HashMap::new()),
         next_session: AtomicU64::new(1),
      }))
   }

   /// Requests a GATT link to `address`.
   ///
   /// Returns immediately. Exactly one of `on_success` / `on_error` runs
   /// once the outcome is known; if the link is already up, `on_success`
   /// runs before this returns.
   pub fn connect<S, E>(
      &self,
      address: DeviceAddress,
      on_success: S,
      on_error: E,
   ) -> ConnectionHandle
   where
      S: FnOnce() + Send + 'static,
      E: FnOnce(ConnectErrorCode) + Send + 'static,
   {
      self.connect_with(
         address,
         Box::new(move |outcome| match outcome {
            Ok(()) => on_success(),
            Err(code) => on_error(code),
         }),
      )
   }

   /// Like [`connect`](Self::connect), with a single continuation taking
   /// the outcome.
   pub fn connect_with(
      &self,
      address: DeviceAddress,
      callback: ConnectCallback,
   ) -> ConnectionHandle {
      self.0.connect(address, callback)
   }

   /// Requests a GATT link and waits for the outcome.
   pub async fn connect_async(&self, address: DeviceAddress) -> Result<ConnectionHandle> {
      let (tx, rx) = oneshot::channel();
      let handle = self.connect_with(
         address,
         Box::new(move |outcome| {
            let _ = tx.send(outcome);
         }),
      );

      match rx.await {
         Ok(Ok(())) => Ok(handle),
         Ok(Err(code)) => Err(GattMuxError::ConnectFailed(code)),
         Err(_) => Err(GattMuxError::ManagerShutdown),
      }
   }

   /// Disconnects the link to `address` on behalf of every handle.
   ///
   /// Handles keep reporting connected until the platform confirms the
   /// disconnect. Returns whether a platform disconnect was requested.
   pub fn disconnect_device(&self, address: DeviceAddress) -> bool {
      self.0.disconnect_device(address)
   }

   /// Forgets a device that disappeared from the platform.
   pub fn remove_device(&self, address: DeviceAddress) {
      self.0.remove_device(address);
   }

   /// Platform notification: the outstanding connect attempt finished.
   pub fn on_connect_completed(&self, address: DeviceAddress, result: Outcome) {
      self.0.on_connect_completed(address, result);
   }

   /// Platform notification: the link is down.
   pub fn on_disconnect_completed(&self, address: DeviceAddress) {
      self.0.on_disconnect_completed(address);
   }

   pub fn link_phase(&self, address: DeviceAddress) -> LinkPhase {
      self
         .0
         .links
         .lock()
         .get(&address)
         .map_or(LinkPhase::Disconnected, Link::phase)
   }

   pub fn links(&self) -> Vec<LinkSnapshot> {
      let mut links: Vec<_> = self
         .0
         .links
         .lock()
         .iter()
         .map(|(addr, link)| link.snapshot(*addr))
         .collect();
      links.sort_by_key(|s| s.address);
      links
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::bluetooth::driver::GattDriver;
   use std::{
      sync::{Barrier, atomic::AtomicUsize},
      thread,
   };

   const ADDR: DeviceAddress = DeviceAddress::new([0x01, 0x00, 0x00, 0x90, 0x1E, 0xBE]);
   const OTHER: DeviceAddress = DeviceAddress::new([0x02, 0x00, 0x00, 0x8B, 0x74, 0x63]);

   #[derive(Default)]
   struct RecordingDriver {
      connects: Mutex<Vec<DeviceAddress>>,
      disconnects: Mutex<Vec<DeviceAddress>>,
   }

   impl GattDriver for RecordingDriver {
      fn connect(&self, address: DeviceAddress) {
         self.connects.lock().push(address);
      }

      fn disconnect(&self, address: DeviceAddress) {
         self.disconnects.lock().push(address);
      }
   }

   #[derive(Default)]
   struct RecordingBus {
      events: Mutex<Vec<(DeviceAddress, LinkEvent)>>,
   }

   impl crate::event::EventBus for RecordingBus {
      fn emit(&self, address: DeviceAddress, event: LinkEvent) {
         self.events.lock().push((address, event));
      }
   }

   #[derive(Default)]
   struct Counters {
      successes: AtomicUsize,
      errors: AtomicUsize,
      last_error: Mutex<Option<ConnectErrorCode>>,
   }

   struct Harness {
      driver: Arc<RecordingDriver>,
      bus: Arc<RecordingBus>,
      mux: GattMultiplexer,
      counters: Arc<Counters>,
      handles: Vec<ConnectionHandle>,
   }

   impl Harness {
      fn new() -> Self {
         let driver = Arc::new(RecordingDriver::default());
         let bus = Arc::new(RecordingBus::default());
         let mux = GattMultiplexer::with_events(driver.clone(), bus.clone());
         Self {
            driver,
            bus,
            mux,
            counters: Arc::default(),
            handles: Vec::new(),
         }
      }

      fn connect(&mut self) {
         let ok = self.counters.clone();
         let err = self.counters.clone();
         let handle = self.mux.connect(
            ADDR,
            move || {
               ok.successes.fetch_add(1, Ordering::SeqCst);
            },
            move |code| {
               err.errors.fetch_add(1, Ordering::SeqCst);
               *err.last_error.lock() = Some(code);
            },
         );
         self.handles.push(handle);
      }

      fn reset_counts(&mut self) {
         self.counters.successes.store(0, Ordering::SeqCst);
         self.counters.errors.store(0, Ordering::SeqCst);
         *self.counters.last_error.lock() = None;
         self.driver.connects.lock().clear();
         self.driver.disconnects.lock().clear();
      }

      fn successes(&self) -> usize {
         self.counters.successes.load(Ordering::SeqCst)
      }

      fn errors(&self) -> usize {
         self.counters.errors.load(Ordering::SeqCst)
      }

      fn last_error(&self) -> Option<ConnectErrorCode> {
         *self.counters.last_error.lock()
      }

      fn connect_attempts(&self) -> usize {
         self.driver.connects.lock().len()
      }

      fn disconnect_attempts(&self) -> usize {
         self.driver.disconnects.lock().len()
      }

      fn complete_connection(&self) {
         self.mux.on_connect_completed(ADDR, Ok(()));
      }

      fn fail_connection(&self, code: ConnectErrorCode) {
         self.mux.on_connect_completed(ADDR, Err(code));
      }

      fn complete_disconnection(&self) {
         self.mux.on_disconnect_completed(ADDR);
      }

      fn none_connected(&self) -> bool {
         self.handles.iter().all(|h| !h.is_connected())
      }
   }

   #[test]
   fn test_create_connection() {
      let mut h = Harness::new();
      h.connect();
      assert_eq!(h.connect_attempts(), 1);
      assert_eq!(h.mux.link_phase(ADDR), LinkPhase::Connecting);
      assert!(!h.handles[0].is_connected());

      h.complete_connection();
      assert_eq!(h.successes(), 1);
      assert_eq!(h.errors(), 0);
      assert!(h.handles[0].is_connected());
      assert_eq!(h.mux.link_phase(ADDR), LinkPhase::Connected);
   }

   #[test]
   fn test_handles_survive_siblings_and_device_removal() {
      let mut h = Harness::new();
      h.connect();
      h.complete_connection();
      assert_eq!(h.successes(), 1);

      // Connect again once already connected.
      h.reset_counts();
      h.connect();
      h.connect();
      assert_eq!(h.connect_attempts(), 0);
      assert_eq!(h.successes(), 2);
      assert_eq!(h.errors(), 0);
      assert_eq!(h.handles.len(), 3);
      assert_eq!(h.handles[0].device_address(), ADDR);
      assert!(h.handles.iter().all(ConnectionHandle::is_connected));

      // Disconnect the first, drop the last. The link stays up.
      h.handles[0].disconnect();
      h.handles.pop();
      assert!(!h.handles[0].is_connected());
      assert!(h.handles[1].is_connected());
      assert_eq!(h.mux.link_phase(ADDR), LinkPhase::Connected);
      assert_eq!(h.disconnect_attempts(), 0);

      h.mux.remove_device(ADDR);
      assert_eq!(h.disconnect_attempts(), 1);
      assert!(h.none_connected());
      assert_eq!(h.handles[0].device_address(), ADDR);
      assert_eq!(h.handles[1].device_address(), ADDR);

      // Late platform notice for the removed device is absorbed.
      h.complete_disconnection();
      assert_eq!(h.disconnect_attempts(), 1);
      assert!(h.mux.links().is_empty());
   }

   #[test]
   fn test_duplicate_platform_connections_notify_once() {
      let mut h = Harness::new();
      h.connect();
      h.complete_connection();
      h.complete_connection();
      assert_eq!(h.connect_attempts(), 1);
      assert_eq!(h.successes(), 1);
      assert_eq!(h.errors(), 0);
      assert!(h.handles[0].is_connected());

      h.reset_counts();
      h.complete_disconnection();
      assert_eq!(h.successes(), 0);
      assert_eq!(h.errors(), 0);
      assert!(!h.handles[0].is_connected());
   }

   #[test]
   fn test_concurrent_requests_share_one_attempt() {
      let mut h = Harness::new();
      h.connect();
      h.connect();
      assert_eq!(h.connect_attempts(), 1);
      assert_eq!(h.mux.links()[0].pending, 2);

      h.complete_connection();
      assert_eq!(h.successes(), 2);
      assert!(h.handles.iter().all(ConnectionHandle::is_connected));
   }

   #[test]
   fn test_already_connected() {
      let mut h = Harness::new();
      h.connect();
      h.complete_connection();
      assert!(h.handles[0].is_connected());

      h.reset_counts();
      h.connect();
      assert_eq!(h.connect_attempts(), 0);
      assert_eq!(h.successes(), 1);
      assert_eq!(h.errors(), 0);
      assert!(h.handles[1].is_connected());
   }

   #[test]
   fn test_new_connection_leaves_previous_disconnected() {
      let mut h = Harness::new();
      h.connect();
      h.complete_connection();

      h.handles[0].disconnect();
      h.complete_disconnection();

      h.connect();
      h.complete_connection();

      assert!(!h.handles[0].is_connected());
      assert!(h.handles[1].is_connected());
   }

   #[test]
   fn test_unsolicited_disconnect_never_reconnects_old_handles() {
      let mut h = Harness::new();
      h.connect();
      h.complete_connection();

      // Link drops without anyone asking.
      h.complete_disconnection();
      assert!(!h.handles[0].is_connected());

      h.connect();
      h.complete_connection();
      assert!(!h.handles[0].is_connected());
      assert!(h.handles[1].is_connected());

      // Dropping the stale handle must not tear down the new link.
      h.reset_counts();
      h.handles.remove(0);
      assert_eq!(h.disconnect_attempts(), 0);
      assert!(h.handles[0].is_connected());
   }

   #[test]
   fn test_disconnect_when_objects_destroyed() {
      let mut h = Harness::new();
      h.connect();
      h.connect();
      h.complete_connection();

      h.reset_counts();
      h.handles.clear();
      assert_eq!(h.disconnect_attempts(), 1);
      assert_eq!(h.mux.link_phase(ADDR), LinkPhase::Disconnecting);

      h.complete_disconnection();
      assert!(h.mux.links().is_empty());
   }

   #[test]
   fn test_disconnect_is_idempotent_per_handle() {
      let mut h = Harness::new();
      h.connect();
      h.connect();
      h.complete_connection();

      h.handles[0].disconnect();
      h.handles[0].disconnect();
      assert_eq!(h.disconnect_attempts(), 0);
      assert!(h.handles[1].is_connected());

      h.handles[1].disconnect();
      h.handles.clear();
      assert_eq!(h.disconnect_attempts(), 1);
   }

   #[test]
   fn test_disconnect_in_progress() {
      let mut h = Harness::new();
      h.connect();
      h.connect();
      h.complete_connection();

      h.reset_counts();
      for handle in &h.handles {
         handle.disconnect();
      }
      assert_eq!(h.disconnect_attempts(), 1);

      // Device is assumed still connected.
      h.connect();
      assert_eq!(h.connect_attempts(), 0);
      assert_eq!(h.successes(), 1);
      assert_eq!(h.errors(), 0);
      assert!(!h.handles[0].is_connected());
      assert!(h.handles[2].is_connected());

      h.reset_counts();
      h.complete_disconnection();
      assert_eq!(h.successes(), 0);
      assert_eq!(h.errors(), 0);
      assert!(h.none_connected());
   }

   #[test]
   fn test_disconnect_before_connecting() {
      let mut h = Harness::new();
      h.connect();
      assert_eq!(h.connect_attempts(), 1);

      h.complete_disconnection();
      assert_eq!(h.successes(), 0);
      assert_eq!(h.errors(), 1);
      assert_eq!(h.last_error(), Some(ConnectErrorCode::Failed));
      assert!(h.none_connected());
   }

   #[test]
   fn test_disconnect_device_then_connect_succeeds() {
      let mut h = Harness::new();
      h.connect();
      assert!(h.mux.disconnect_device(ADDR));
      assert!(!h.mux.disconnect_device(ADDR));
      assert_eq!(h.connect_attempts(), 1);
      assert_eq!(h.disconnect_attempts(), 1);

      h.complete_connection();
      assert_eq!(h.successes(), 1);
      assert_eq!(h.errors(), 0);
      assert!(h.handles[0].is_connected());
      assert_eq!(h.disconnect_attempts(), 1);

      h.reset_counts();
      h.complete_disconnection();
      assert_eq!(h.successes(), 0);
      assert_eq!(h.errors(), 0);
      assert!(h.none_connected());
   }

   #[test]
   fn test_disconnect_device_then_disconnect() {
      let mut h = Harness::new();
      h.connect();
      h.mux.disconnect_device(ADDR);
      assert_eq!(h.connect_attempts(), 1);
      assert_eq!(h.disconnect_attempts(), 1);

      h.complete_disconnection();
      assert_eq!(h.successes(), 0);
      assert_eq!(h.errors(), 1);
      assert_eq!(h.last_error(), Some(ConnectErrorCode::Failed));
      assert!(h.none_connected());
   }

   #[test]
   fn test_release_while_connecting_keeps_outcome() {
      let mut h = Harness::new();
      h.connect();
      h.handles[0].disconnect();
      assert_eq!(h.disconnect_attempts(), 1);
      assert_eq!(h.mux.link_phase(ADDR), LinkPhase::Disconnecting);

      h.complete_connection();
      assert_eq!(h.successes(), 1);
      assert_eq!(h.disconnect_attempts(), 1);
      assert!(!h.handles[0].is_connected());
   }

   #[test]
   fn test_connect_waits_for_outstanding_disconnect() {
      let mut h = Harness::new();
      h.connect();
      h.handles[0].disconnect();
      h.fail_connection(ConnectErrorCode::Failed);
      assert_eq!(h.mux.link_phase(ADDR), LinkPhase::Disconnecting);

      h.reset_counts();
      h.connect();
      assert_eq!(h.connect_attempts(), 0);
      assert_eq!(h.mux.link_phase(ADDR), LinkPhase::Disconnecting);
      assert_eq!(h.mux.links()[0].pending, 1);

      // The old disconnect settles; only then does the new attempt start.
      h.complete_disconnection();
      assert_eq!(h.successes(), 0);
      assert_eq!(h.errors(), 0);
      assert_eq!(h.connect_attempts(), 1);
      assert_eq!(h.mux.link_phase(ADDR), LinkPhase::Connecting);

      h.complete_connection();
      assert_eq!(h.successes(), 1);
      assert_eq!(h.errors(), 0);
      assert!(!h.handles[0].is_connected());
      assert!(h.handles[1].is_connected());
      assert_eq!(h.disconnect_attempts(), 0);
      assert_eq!(h.mux.link_phase(ADDR), LinkPhase::Connected);
   }

   #[test]
   fn test_deferred_connect_released_before_it_starts() {
      let mut h = Harness::new();
      h.connect();
      h.handles[0].disconnect();
      h.fail_connection(ConnectErrorCode::Failed);
      h.reset_counts();

      // Parked behind the outstanding disconnect, then dropped.
      h.connect();
      h.handles.pop();
      assert_eq!(h.connect_attempts(), 0);

      // The attempt still runs and reports, then the link is torn down.
      h.complete_disconnection();
      assert_eq!(h.connect_attempts(), 1);
      h.complete_connection();
      assert_eq!(h.successes(), 1);
      assert_eq!(h.disconnect_attempts(), 1);
      assert_eq!(h.mux.link_phase(ADDR), LinkPhase::Disconnecting);

      h.complete_disconnection();
      assert!(h.mux.links().is_empty());
   }

   #[test]
   fn test_remove_device_fails_deferred_requests() {
      let mut h = Harness::new();
      h.connect();
      h.handles[0].disconnect();
      h.connect();
      assert_eq!(h.connect_attempts(), 1);

      // Both the in-flight and the parked requester hear about it.
      h.mux.remove_device(ADDR);
      assert_eq!(h.errors(), 2);
      assert_eq!(h.last_error(), Some(ConnectErrorCode::Failed));
      assert!(h.mux.links().is_empty());
   }

   #[test]
   fn test_concurrent_threads_share_one_attempt() {
      const THREADS: usize = 8;

      let driver = Arc::new(RecordingDriver::default());
      let mux = GattMultiplexer::new(driver.clone());
      let successes = Arc::new(AtomicUsize::new(0));
      let barrier = Barrier::new(THREADS);

      let handles: Vec<ConnectionHandle> = thread::scope(|s| {
         let workers: Vec<_> = (0..THREADS)
            .map(|_| {
               s.spawn(|| {
                  let successes = successes.clone();
                  barrier.wait();
                  mux.connect(
                     ADDR,
                     move || {
                        successes.fetch_add(1, Ordering::SeqCst);
                     },
                     |_| panic!("connect failed"),
                  )
               })
            })
            .collect();
         workers.into_iter().map(|w| w.join().unwrap()).collect()
      });

      assert_eq!(*driver.connects.lock(), vec![ADDR]);
      assert_eq!(mux.links()[0].pending, THREADS);
      assert_eq!(mux.links()[0].interest, THREADS);

      mux.on_connect_completed(ADDR, Ok(()));
      assert_eq!(successes.load(Ordering::SeqCst), THREADS);
      assert!(handles.iter().all(ConnectionHandle::is_connected));
      assert_eq!(*driver.connects.lock(), vec![ADDR]);
   }

   #[test]
   fn test_error_after_connection_notifies_once() {
      let mut h = Harness::new();
      h.connect();
      assert_eq!(h.connect_attempts(), 1);

      h.fail_connection(ConnectErrorCode::AuthFailed);
      h.fail_connection(ConnectErrorCode::Failed);
      assert_eq!(h.successes(), 0);
      assert_eq!(h.errors(), 1);
      assert_eq!(h.last_error(), Some(ConnectErrorCode::AuthFailed));
      assert!(h.none_connected());
      assert!(h.mux.links().is_empty());
   }

   #[test]
   fn test_retry_after_failure_issues_new_attempt() {
      let mut h = Harness::new();
      h.connect();
      h.fail_connection(ConnectErrorCode::Failed);

      h.reset_counts();
      h.connect();
      assert_eq!(h.connect_attempts(), 1);
      h.complete_connection();
      assert_eq!(h.successes(), 1);
      assert!(!h.handles[0].is_connected());
      assert!(h.handles[1].is_connected());
   }

   #[test]
   fn test_fan_out_is_fifo() {
      let driver = Arc::new(RecordingDriver::default());
      let mux = GattMultiplexer::new(driver);
      let order = Arc::new(Mutex::new(Vec::new()));

      let handles: Vec<_> = (0..4)
         .map(|i| {
            let order = order.clone();
            mux.connect_with(
               ADDR,
               Box::new(move |outcome| {
                  assert_eq!(outcome, Err(ConnectErrorCode::AuthTimeout));
                  order.lock().push(i);
               }),
            )
         })
         .collect();

      mux.on_connect_completed(ADDR, Err(ConnectErrorCode::AuthTimeout));
      assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
      drop(handles);
   }

   #[test]
   fn test_addresses_are_independent() {
      let driver = Arc::new(RecordingDriver::default());
      let mux = GattMultiplexer::new(driver.clone());

      let a = mux.connect(ADDR, || {}, |_| {});
      let b = mux.connect(OTHER, || {}, |_| {});
      assert_eq!(*driver.connects.lock(), vec![ADDR, OTHER]);

      mux.on_connect_completed(OTHER, Ok(()));
      assert!(!a.is_connected());
      assert!(b.is_connected());

      drop(b);
      assert_eq!(*driver.disconnects.lock(), vec![OTHER]);
      assert_eq!(mux.link_phase(ADDR), LinkPhase::Connecting);
   }

   #[test]
   fn test_events_follow_link_transitions() {
      let mut h = Harness::new();
      h.connect();
      h.complete_connection();
      h.complete_connection();
      h.complete_disconnection();
      h.connect();
      h.fail_connection(ConnectErrorCode::AuthRejected);

      assert_eq!(
         *h.bus.events.lock(),
         vec![
            (ADDR, LinkEvent::Connected),
            (ADDR, LinkEvent::Disconnected),
            (ADDR, LinkEvent::ConnectFailed(ConnectErrorCode::AuthRejected)),
         ]
      );
   }

   #[test]
   fn test_handle_outlives_multiplexer() {
      let mut h = Harness::new();
      h.connect();
      h.complete_connection();

      let handle = h.handles.pop().unwrap();
      drop(h);
      assert!(!handle.is_connected());
      assert_eq!(handle.device_address(), ADDR);
      handle.disconnect();
   }

   /// Driver that answers synchronously from inside the request.
   struct EagerDriver {
      mux: Mutex<Option<GattMultiplexer>>,
      result: Outcome,
   }

   impl GattDriver for EagerDriver {
      fn connect(&self, address: DeviceAddress) {
         let mux = self.mux.lock().clone();
         if let Some(mux) = mux {
            mux.on_connect_completed(address, self.result);
         }
      }

      fn disconnect(&self, address: DeviceAddress) {
         let mux = self.mux.lock().clone();
         if let Some(mux) = mux {
            mux.on_disconnect_completed(address);
         }
      }
   }

   #[test]
   fn test_reentrant_driver() {
      let driver = Arc::new(EagerDriver {
         mux: Mutex::new(None),
         result: Ok(()),
      });
      let mux = GattMultiplexer::new(driver.clone());
      *driver.mux.lock() = Some(mux.clone());

      let connected = Arc::new(AtomicUsize::new(0));
      let counter = connected.clone();
      let handle = mux.connect(
         ADDR,
         move || {
            counter.fetch_add(1, Ordering::SeqCst);
         },
         |_| {},
      );
      assert_eq!(connected.load(Ordering::SeqCst), 1);
      assert!(handle.is_connected());

      drop(handle);
      assert!(mux.links().is_empty());
      driver.mux.lock().take();
   }

   #[tokio::test]
   async fn test_connect_async() {
      let driver = Arc::new(EagerDriver {
         mux: Mutex::new(None),
         result: Err(ConnectErrorCode::AuthCanceled),
      });
      let mux = GattMultiplexer::new(driver.clone());
      *driver.mux.lock() = Some(mux.clone());

      let err = mux.connect_async(ADDR).await.unwrap_err();
      assert!(matches!(
         err,
         GattMuxError::ConnectFailed(ConnectErrorCode::AuthCanceled)
      ));

      let h = Harness::new();
      let mux = h.mux.clone();
      let pending = tokio::spawn(async move { mux.connect_async(ADDR).await });
      while h.connect_attempts() == 0 {
         tokio::task::yield_now().await;
      }
      h.complete_connection();
      let handle = pending.await.unwrap().unwrap();
      assert!(handle.is_connected());
      driver.mux.lock().take();
   }
}
