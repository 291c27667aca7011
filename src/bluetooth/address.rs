//! Device address canonicalization.
//!
//! Raw addresses arrive in several textual shapes (`1a-2b-..`, `1A2B..`,
//! `1A:2B:..`). Everything entering the multiplexer is first reduced to a
//! [`DeviceAddress`], whose only textual form is `XX:XX:XX:XX:XX:XX`.

use core::fmt;
use std::str::FromStr;

use bluer::Address;
use serde::{Serialize, Serializer};

use crate::error::GattMuxError;

/// Number of octets in a Bluetooth device address.
const ADDRESS_LEN: usize = 6;
/// Length of the separated textual form, e.g. `1A:2B:3C:4D:5E:6F`.
const SEPARATED_LEN: usize = ADDRESS_LEN * 3 - 1;

/// A canonicalized 6-byte Bluetooth device address.
///
/// Equality and hashing are on the bytes, never on the input text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceAddress([u8; ADDRESS_LEN]);

impl DeviceAddress {
   pub const fn new(octets: [u8; ADDRESS_LEN]) -> Self {
      Self(octets)
   }
}

/// Normalizes `raw` into a device address.
///
/// Octets may be separated uniformly by `:`, uniformly by `-`, or not at
/// all. Input is case-insensitive. Returns `None` for anything else.
pub fn canonicalize(raw: &str) -> Option<DeviceAddress> {
   let bytes = raw.as_bytes();
   let mut digits = [0u8; ADDRESS_LEN * 2];

   match bytes.len() {
      n if n == ADDRESS_LEN * 2 => digits.copy_from_slice(bytes),
      SEPARATED_LEN => {
         let separator = bytes[2];
         if separator != b':' && separator != b'-' {
            return None;
         }
         let mut n = 0;
         for (i, &b) in bytes.iter().enumerate() {
            if i % 3 == 2 {
               if b != separator {
                  return None;
               }
            } else {
               digits[n] = b;
               n += 1;
            }
         }
      },
      _ => return None,
   }

   let mut octets = [0u8; ADDRESS_LEN];
   hex::decode_to_slice(digits, &mut octets).ok()?;
   Some(DeviceAddress(octets))
}

/// Returns the canonical text of `raw`, or an empty string if it is not a
/// valid address.
pub fn canonicalize_address(raw: &str) -> String {
   canonicalize(raw).map(|a| a.to_string()).unwrap_or_default()
}

impl fmt::Display for DeviceAddress {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let [a, b, c, d, e, g] = self.0;
      write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
   }
}

impl FromStr for DeviceAddress {
   type Err = GattMuxError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      canonicalize(s).ok_or_else(|| GattMuxError::InvalidAddress(s.to_string()))
   }
}

impl Serialize for DeviceAddress {
   fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
      serializer.collect_str(self)
   }
}

impl From<Address> for DeviceAddress {
   fn from(addr: Address) -> Self {
      Self(addr.0)
   }
}

impl From<DeviceAddress> for Address {
   fn from(addr: DeviceAddress) -> Self {
      Address::new(addr.0)
   }
}
