//! Error types for the GATT multiplexer service.
//!
//! This module defines the service-wide error type along with the
//! connect error codes handed to connection requesters.

use serde::Serialize;
use strum::{Display, IntoStaticStr};
use thiserror::Error;

/// Outcome code delivered to every pending requester of a failed connect
/// attempt. Codes are passed through from the driver unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, Serialize)]
pub enum ConnectErrorCode {
   Unknown,
   InProgress,
   Failed,
   AuthFailed,
   AuthCanceled,
   AuthRejected,
   AuthTimeout,
   UnsupportedDevice,
}

impl ConnectErrorCode {
   /// Maps a BlueZ error onto a connect error code.
   pub fn from_bluer(err: &bluer::Error) -> Self {
      use bluer::ErrorKind;

      match err.kind {
         ErrorKind::AuthenticationFailed => Self::AuthFailed,
         ErrorKind::AuthenticationCanceled => Self::AuthCanceled,
         ErrorKind::AuthenticationRejected => Self::AuthRejected,
         ErrorKind::AuthenticationTimeout => Self::AuthTimeout,
         ErrorKind::InProgress => Self::InProgress,
         ErrorKind::NotSupported => Self::UnsupportedDevice,
         ErrorKind::ConnectionAttemptFailed
         | ErrorKind::Failed
         | ErrorKind::NotReady
         | ErrorKind::NotAvailable => Self::Failed,
         _ => Self::Unknown,
      }
   }
}

/// Main error type for the GATT multiplexer service.
#[derive(Error, Debug)]
pub enum GattMuxError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Invalid device address: {0:?}")]
   InvalidAddress(String),

   #[error("Connection failed: {0}")]
   ConnectFailed(ConnectErrorCode),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Multiplexer has been shut down")]
   ManagerShutdown,

   #[error("Adapter not found")]
   AdapterNotFound,
}

/// Convenience type alias for Results with `GattMuxError`.
pub type Result<T> = std::result::Result<T, GattMuxError>;
