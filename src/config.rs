//! Configuration management for the keyboard relay service.
//!
//! This module handles loading and saving configuration from disk,
//! including adapter selection, profile registration and relay timing.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{KbdError, Result};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
   /// Adapter to prepare, `None` picks the default adapter.
   #[serde(default)]
   pub adapter: Option<String>,

   #[serde(default = "default_profile_path")]
   pub profile_path: String,

   #[serde(default = "default_profile_uuid")]
   pub profile_uuid: String,

   #[serde(default = "default_service_name")]
   pub service_name: String,

   #[serde(default = "default_service_description")]
   pub service_description: String,

   #[serde(default = "default_provider_name")]
   pub provider_name: String,

   #[serde(default = "default_discoverable")]
   pub discoverable: bool,

   #[serde(default = "default_read_timeout")]
   pub read_timeout_ms: u64,

   #[serde(default = "default_retry_delay")]
   pub retry_delay_ms: u64,

   /// Consecutive non-timeout USB read errors tolerated, 0 disables the limit.
   #[serde(default = "default_max_device_errors")]
   pub max_device_errors: u32,
}

fn default_profile_path() -> String {
   "/org/btkbd/profile".to_string()
}

fn default_profile_uuid() -> String {
   "00001124-0000-1000-8000-00805f9b34fb".to_string()
}

fn default_service_name() -> String {
   "Virtual Bluetooth Keyboard".to_string()
}

fn default_service_description() -> String {
   "USB > BT Keyboard".to_string()
}

fn default_provider_name() -> String {
   "btkbd".to_string()
}

const fn default_discoverable() -> bool {
   true
}

const fn default_read_timeout() -> u64 {
   1000
}

const fn default_retry_delay() -> u64 {
   1
}

const fn default_max_device_errors() -> u32 {
   10
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         profile_path: default_profile_path(),
         profile_uuid: default_profile_uuid(),
         service_name: default_service_name(),
         service_description: default_service_description(),
         provider_name: default_provider_name(),
         discoverable: default_discoverable(),
         read_timeout_ms: default_read_timeout(),
         retry_delay_ms: default_retry_delay(),
         max_device_errors: default_max_device_errors(),
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

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BTKBD_HOME") {
         PathBuf::from(home)
      } else {
         dirs::config_dir().ok_or(KbdError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("btkbd").join("config.toml"))
   }

   pub const fn read_timeout(&self) -> Duration {
      Duration::from_millis(self.read_timeout_ms)
   }

   pub const fn retry_delay(&self) -> Duration {
      Duration::from_millis(self.retry_delay_ms)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_missing_file_writes_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("btkbd").join("config.toml");

      let config = Config::load_from(&path).unwrap();
      assert_eq!(config, Config::default());
      assert!(path.exists());

      // Second load reads back what was written
      assert_eq!(Config::load_from(&path).unwrap(), config);
   }

   #[test]
   fn test_partial_file_fills_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "adapter = \"hci1\"\nmax_device_errors = 0\n").unwrap();

      let config = Config::load_from(&path).unwrap();
      assert_eq!(config.adapter.as_deref(), Some("hci1"));
      assert_eq!(config.max_device_errors, 0);
      assert_eq!(config.read_timeout(), Duration::from_secs(1));
      assert_eq!(config.retry_delay(), Duration::from_millis(1));
      assert_eq!(config.profile_path, "/org/btkbd/profile");
   }

   #[test]
   fn test_invalid_toml_is_reported() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "read_timeout_ms = \"soon\"").unwrap();

      assert!(matches!(
         Config::load_from(&path),
         Err(KbdError::TomlParse(_))
      ));
   }
}
