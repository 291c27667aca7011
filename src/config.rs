//! Configuration management for the multiplexer service.
//!
//! This module handles loading and saving configuration from disk,
//! including the adapter choice, devices to hold a link to, and
//! connection parameters.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use log::warn;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   bluetooth::address::{self, DeviceAddress},
   error::{GattMuxError, Result},
};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
   /// Adapter to use, e.g. `hci0`. The system default when unset.
   #[serde(default)]
   pub adapter: Option<SmolStr>,

   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_sec: u64,
}

/// A device the service keeps a connection handle to from startup.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct KnownDevice {
   pub address: String,
   pub name: SmolStr,
}

const fn default_connect_timeout() -> u64 {
   30
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         known_devices: vec![],
         connect_timeout_sec: default_connect_timeout(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the configuration to `path`, creating parent directories.
   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      if let Ok(home) = env::var("GATTMUX_HOME") {
         return Ok(PathBuf::from(home).join("config.toml"));
      }

      let config_dir = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else {
         dirs::config_dir().ok_or(GattMuxError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("gattmuxd").join("config.toml"))
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_sec)
   }

   /// Canonical addresses of the known devices. Malformed entries are
   /// skipped.
   pub fn known_addresses(&self) -> Vec<(DeviceAddress, &str)> {
      self
         .known_devices
         .iter()
         .filter_map(|d| match address::canonicalize(&d.address) {
            Some(addr) => Some((addr, d.name.as_str())),
            None => {
               warn!("Ignoring known device {:?}: invalid address {:?}", d.name, d.address);
               None
            },
         })
         .collect()
   }
}
