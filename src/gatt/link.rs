//! Per-address link state.

use serde::Serialize;
use serde_json::json;
use smallvec::SmallVec;
use strum::{Display, IntoStaticStr};

use crate::{bluetooth::address::DeviceAddress, error::ConnectErrorCode};

/// Result of one connect attempt, as seen by each requester.
pub type Outcome = Result<(), ConnectErrorCode>;

/// Continuation awaiting the outcome of a connect attempt.
pub type ConnectCallback = Box<dyn FnOnce(Outcome) + Send>;

/// Lifecycle phase of a link.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, IntoStaticStr, Serialize)]
pub enum LinkPhase {
   Disconnected,
   Connecting,
   Connected,
   Disconnecting,
}

/// State of the one physical link to a device.
///
/// The phase is derived from three flags because a disconnect may be
/// requested while a connect attempt is still outstanding, and both must
/// be resolved independently.
pub(crate) struct Link {
   /// Current session id; renewed each time the link falls back to
   /// disconnected.
   pub session: u64,
   /// The platform reported the link up and has not reported it down.
   pub gatt_connected: bool,
   pub connect_in_flight: bool,
   pub disconnect_in_flight: bool,
   /// Handles of the current session that have not disconnected.
   pub interest: usize,
   pub pending: SmallVec<[ConnectCallback; 2]>,
   /// Requests made while a disconnect was outstanding on a link that is
   /// not up. They start the next attempt once the link is down.
   pub deferred: Option<Deferred>,
   pub last_error: Option<ConnectErrorCode>,
}

/// Connect requests parked behind an outstanding disconnect.
pub(crate) struct Deferred {
   /// Session their handles join when the attempt starts.
   pub session: u64,
   pub interest: usize,
   pub callbacks: SmallVec<[ConnectCallback; 2]>,
}

impl Deferred {
   pub fn new(session: u64) -> Self {
      Self {
         session,
         interest: 0,
         callbacks: SmallVec::new(),
      }
   }
}

impl Link {
   pub fn new(session: u64) -> Self {
      Self {
         session,
         gatt_connected: false,
         connect_in_flight: false,
         disconnect_in_flight: false,
         interest: 0,
         pending: SmallVec::new(),
         deferred: None,
         last_error: None,
      }
   }

   pub const fn phase(&self) -> LinkPhase {
      if self.disconnect_in_flight {
         LinkPhase::Disconnecting
      } else if self.connect_in_flight {
         LinkPhase::Connecting
      } else if self.gatt_connected {
         LinkPhase::Connected
      } else {
         LinkPhase::Disconnected
      }
   }

   /// Whether a platform disconnect should be issued now: the link is up or
   /// coming up, no disconnect is outstanding, and `force` or no interest
   /// remains.
   pub const fn wants_disconnect(&self, force: bool) -> bool {
      (self.gatt_connected || self.connect_in_flight)
         && !self.disconnect_in_flight
         && (force || self.interest == 0)
   }

   /// Drops every handle of the current session and starts a new one.
   pub fn reset_session(&mut self, session: u64) {
      self.session = session;
      self.interest = 0;
   }

   /// A link can be forgotten once it is down with nobody waiting on it.
   pub fn is_reapable(&self) -> bool {
      self.phase() == LinkPhase::Disconnected
         && self.interest == 0
         && self.pending.is_empty()
         && self.deferred.is_none()
   }

   pub fn snapshot(&self, address: DeviceAddress) -> LinkSnapshot {
      LinkSnapshot {
         address,
         phase: self.phase(),
         interest: self.interest,
         pending: self.pending.len() + self.deferred.as_ref().map_or(0, |d| d.callbacks.len()),
         last_error: self.last_error,
      }
   }
}

/// Point-in-time view of a link, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkSnapshot {
   pub address: DeviceAddress,
   pub phase: LinkPhase,
   pub interest: usize,
   pub pending: usize,
   pub last_error: Option<ConnectErrorCode>,
}

impl LinkSnapshot {
   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "address": self.address,
         "phase": <&'static str>::from(self.phase),
         "interest": self.interest,
         "pending": self.pending,
         "last_error": self.last_error.map(<&'static str>::from),
      })
   }
}
