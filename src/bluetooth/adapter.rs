//! Bluetooth adapter preparation through BlueZ.

use bluer::Session;
use log::{info, warn};

use crate::{config::Config, error::Result};

/// Class of device for a peripheral keyboard (limited discoverable, peripheral, keyboard)
const KEYBOARD_CLASS: u32 = 0x002540;

/// Powers on the configured adapter and, if requested, makes it pairable
/// and discoverable without timeout.
pub async fn prepare(config: &Config) -> Result<()> {
   let session = Session::new().await?;
   let adapter = match &config.adapter {
      Some(name) => session.adapter(name)?,
      None => session.default_adapter().await?,
   };
   let name = adapter.name().to_string();
   info!("Preparing adapter {name} ({})", adapter.address().await?);

   if !adapter.is_powered().await? {
      adapter.set_powered(true).await?;
      info!("Powered on adapter: {name}");
   }

   if config.discoverable {
      adapter.set_pairable(true).await?;
      adapter.set_discoverable_timeout(0).await?;
      adapter.set_discoverable(true).await?;
      info!("Adapter {name} is discoverable");
   }

   match adapter.class().await {
      Ok(class) if class & 0x1fff == KEYBOARD_CLASS & 0x1fff => {},
      Ok(class) => warn!(
         "Adapter {name} has class {class:#08x}, hosts may not list it as a keyboard; set Class = {KEYBOARD_CLASS:#08x} in BlueZ main.conf"
      ),
      Err(e) => warn!("Failed to read class of adapter {name}: {e}"),
   }

   Ok(())
}
