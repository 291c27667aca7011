//! Bluetooth platform layer.
//!
//! This module provides address canonicalization, the driver interface
//! the multiplexer consumes, and its BlueZ implementation.

pub mod address;
pub mod bluez;
pub mod driver;
