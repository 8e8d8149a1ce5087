//! Bluetooth HID keyboard relay.
//!
//! Presents the first USB keyboard found on this machine to Bluetooth hosts
//! as a HID keyboard, forwarding every input report over L2CAP.

use std::{env, sync::Arc};

use log::{error, info, warn};
use tokio::{select, signal, task};
use zbus::connection;

mod bluetooth;
mod config;
mod error;
mod event;
mod hid;

use crate::{
   bluetooth::{
      adapter,
      broker::ConnectionBroker,
      l2cap::{RetryPolicy, SocketContext},
      profile::{self, HidProfile},
      sdp::{self, ServiceNames},
   },
   config::Config,
   error::{KbdError, Result},
   hid::{
      device::UsbKeyboard,
      keyboard::{Keyboard, RelayConfig},
   },
};

fn init_logging() {
   let default = match env::var("DEBUG").as_deref() {
      Ok("1" | "true") => "debug",
      _ => "info",
   };
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

#[tokio::main]
async fn main() -> Result<()> {
   init_logging();

   info!("Starting btkbd...");

   let config = Config::load()?;

   let usb = UsbKeyboard::open_first()?;
   let descriptor = usb.descriptor().to_vec();
   let keyboard = Keyboard::new(
      Box::new(usb),
      descriptor,
      RelayConfig {
         read_timeout: config.read_timeout(),
         max_device_errors: config.max_device_errors,
         ..Default::default()
      },
   );

   adapter::prepare(&config).await?;

   let ctx = SocketContext::kernel(RetryPolicy {
      delay: config.retry_delay(),
   });
   let (broker, mut events) = ConnectionBroker::new(ctx)?;

   let connection = connection::Builder::system()?
      .serve_at(
         config.profile_path.as_str(),
         HidProfile::new(Arc::new(broker)),
      )?
      .build()
      .await?;

   let record = sdp::hid_keyboard_record(keyboard.descriptor(), ServiceNames::from_config(&config));
   profile::register(
      &connection,
      &config.profile_path,
      &config.profile_uuid,
      &record,
   )
   .await?;
   info!(
      "HID profile registered, descriptor {}",
      hex::encode(keyboard.descriptor())
   );

   let mut relay = task::spawn_blocking({
      let keyboard = keyboard.clone();
      move || keyboard.handle_hid()
   });

   let finished = loop {
      select! {
         _ = signal::ctrl_c() => {
            warn!("Exiting on user interrupt");
            break None;
         }
         Some(client) = events.connections.recv() => {
            let client = Arc::new(client);
            if let Err(e) = keyboard.connect(client.clone()) {
               warn!("Refused {}: {e}", client.device);
               if let Err(e) = client.close() {
                  warn!("Failed to close refused client {}: {e}", client.device);
               }
            }
         }
         Some(device) = events.disconnections.recv() => {
            if let Err(e) = keyboard.disconnect(&device) {
               warn!("Error while disconnecting {device}: {e}");
            }
         }
         joined = &mut relay => {
            break Some(joined);
         }
      }
   };

   // Waits for an in-flight USB read, bounded by the read timeout
   task::block_in_place(|| keyboard.stop());
   let joined = match finished {
      Some(joined) => joined,
      None => relay.await,
   };
   let outcome = match joined {
      Ok(result) => result,
      Err(e) => Err(KbdError::from(e)),
   };
   if let Err(e) = &outcome {
      error!("Keyboard relay failed: {e}");
   }

   if let Some(client) = keyboard.client()
      && let Err(e) = keyboard.disconnect(&client.device)
   {
      warn!("Error while disconnecting {}: {e}", client.device);
   }

   if let Err(e) = profile::unregister(&connection, &config.profile_path).await {
      warn!("Failed to unregister profile: {e}");
   }

   info!("Shutting down btkbd...");
   outcome
}
