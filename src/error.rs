//! Error types for the keyboard relay service.
//!
//! This module defines all error types that can occur while relaying a USB
//! keyboard over Bluetooth, including socket, D-Bus, HID device and
//! configuration errors.

use thiserror::Error;
use tokio::task::JoinError;

/// Main error type for the keyboard relay service.
#[derive(Error, Debug)]
pub enum KbdError {
   #[error("Socket error: {0}")]
   Socket(#[from] std::io::Error),

   #[error("Invalid argument: {0}")]
   InvalidArgument(&'static str),

   #[error("Keyboard in use")]
   InUse,

   #[error("Invalid L2CAP address: {0}")]
   InvalidAddress(String),

   #[error("Connection broker has been shut down")]
   BrokerShutdown,

   #[error("No USB HID keyboard found")]
   DeviceNotFound,

   #[error("Keyboard lost after {0} consecutive read errors")]
   DeviceLost(u32),

   #[error("HID error: {0}")]
   Hid(#[from] hidapi::HidError),

   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusFdo(#[from] zbus::fdo::Error),

   #[error("Actor panicked: {0}")]
   ActorPanicked(#[from] JoinError),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

impl KbdError {
   /// Returns the raw OS error code for socket errors.
   pub fn raw_os_error(&self) -> Option<i32> {
      match self {
         Self::Socket(e) => e.raw_os_error(),
         _ => None,
      }
   }
}

/// Convenience type alias for Results with `KbdError`.
pub type Result<T> = std::result::Result<T, KbdError>;
