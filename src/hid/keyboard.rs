//! Keyboard relay: one USB keyboard, at most one Bluetooth host.
//!
//! The relay owns the USB report source and the active-client slot. The
//! slot is the only shared mutable state; [`Keyboard::connect`],
//! [`Keyboard::disconnect`], [`Keyboard::disconnect_client`] and
//! [`Keyboard::stop`] are the only entry points that mutate it or the device, and [`Keyboard::client`] hands out
//! snapshots to the loops.

use std::{
   mem,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   thread,
   time::Duration,
};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::select;

use crate::{
   error::{KbdError, Result},
   event::{Client, DeviceId},
   hid::{
      device::ReportSource,
      protocol::{self, CONTROL_MTU, PKT_HELLO, Transaction},
   },
};

#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
   /// How long one USB read may wait for a report.
   pub read_timeout: Duration,
   /// Consecutive non-timeout read errors before the relay gives up, 0 for never.
   pub max_device_errors: u32,
   /// Pause after a failed USB read.
   pub error_backoff: Duration,
}

impl Default for RelayConfig {
   fn default() -> Self {
      Self {
         read_timeout: Duration::from_secs(1),
         max_device_errors: 10,
         error_backoff: Duration::from_millis(100),
      }
   }
}

enum LinkState {
   Idle,
   Connected(Arc<Client>),
}

pub struct Keyboard {
   state: Mutex<LinkState>,
   device: Mutex<Option<Box<dyn ReportSource>>>,
   descriptor: Vec<u8>,
   stopped: AtomicBool,
   config: RelayConfig,
}

impl Keyboard {
   pub fn new(source: Box<dyn ReportSource>, descriptor: Vec<u8>, config: RelayConfig) -> Arc<Self> {
      Arc::new(Self {
         state: Mutex::new(LinkState::Idle),
         device: Mutex::new(Some(source)),
         descriptor,
         stopped: AtomicBool::new(false),
         config,
      })
   }

   /// HID report descriptor of the USB keyboard.
   pub fn descriptor(&self) -> &[u8] {
      &self.descriptor
   }

   /// The active client, if any.
   pub fn client(&self) -> Option<Arc<Client>> {
      match &*self.state.lock() {
         LinkState::Connected(client) => Some(client.clone()),
         LinkState::Idle => None,
      }
   }

   /// Makes `client` the active host and starts serving its control channel.
   ///
   /// Fails with [`KbdError::InUse`] while another client is active; the
   /// caller still owns the rejected client and must close it.
   pub fn connect(self: &Arc<Self>, client: Arc<Client>) -> Result<()> {
      let mut state = self.state.lock();
      if let LinkState::Connected(active) = &*state {
         warn!(
            "Rejecting {}, keyboard in use by {}",
            client.device, active.device
         );
         return Err(KbdError::InUse);
      }

      for hello in PKT_HELLO {
         if let Err(e) = client.control.write(hello) {
            warn!("Failed to send hello to {}: {e}", client.device);
            return Err(e);
         }
      }

      *state = LinkState::Connected(client.clone());
      drop(state);
      info!("Connected to {}", client.device);

      tokio::spawn(self.clone().handle_handshake(client));
      Ok(())
   }

   /// Tears down the active client if it is `device`.
   ///
   /// Stale or duplicate requests for any other device are a no-op. The slot
   /// is cleared and the done signal fired even if closing a socket fails;
   /// the first close error is returned.
   pub fn disconnect(&self, device: &DeviceId) -> Result<()> {
      self.teardown(|active| active.device == *device)
   }

   /// Tears down `client` only if it is still the active one.
   ///
   /// A host reconnecting gets the same device path, so a finished session
   /// must be matched by identity, never by path.
   pub fn disconnect_client(&self, client: &Arc<Client>) -> Result<()> {
      if client.done.is_fired() {
         return Ok(());
      }
      self.teardown(|active| Arc::ptr_eq(active, client))
   }

   fn teardown(&self, matches: impl FnOnce(&Arc<Client>) -> bool) -> Result<()> {
      let mut state = self.state.lock();
      let client = match mem::replace(&mut *state, LinkState::Idle) {
         LinkState::Connected(active) if matches(&active) => active,
         other => {
            *state = other;
            return Ok(());
         },
      };

      info!("Disconnecting {}", client.device);
      let result = client.close();
      client.done.fire();
      result
   }

   /// Closes the USB device, making [`handle_hid`] return.
   ///
   /// Safe to call repeatedly. Waits for an in-flight read to finish, which
   /// takes at most the configured read timeout.
   ///
   /// [`handle_hid`]: Keyboard::handle_hid
   pub fn stop(&self) {
      if self.stopped.swap(true, Ordering::SeqCst) {
         return;
      }
      drop(self.device.lock().take());
      warn!("Keyboard stopped");
   }

   /// Relays USB input reports to the active client until the device is
   /// closed by [`stop`] or keeps failing.
   ///
   /// Blocks the calling thread.
   ///
   /// [`stop`]: Keyboard::stop
   pub fn handle_hid(&self) -> Result<()> {
      let mut failures = 0u32;
      loop {
         let read = {
            let mut device = self.device.lock();
            let Some(source) = device.as_mut() else {
               info!("Keyboard closed, relay exiting");
               return Ok(());
            };
            source.read_report(self.config.read_timeout)
         };

         match read {
            Ok(None) => failures = 0,
            Ok(Some(report)) => {
               failures = 0;
               self.relay_report(&report);
            },
            Err(e) => {
               failures += 1;
               error!("Error in read from keyboard: {e}");
               if self.config.max_device_errors != 0 && failures >= self.config.max_device_errors {
                  return Err(KbdError::DeviceLost(failures));
               }
               thread::sleep(self.config.error_backoff);
            },
         }
      }
   }

   fn relay_report(&self, report: &[u8]) {
      debug!("Keyboard input: {}", hex::encode(report));

      let Some(client) = self.client() else {
         return;
      };

      if let Err(e) = client.interrupt.write(&protocol::input_frame(report)) {
         error!("Error in write to {}: {e}", client.device);
      }
   }

   /// Answers control-channel transactions until the client's done signal
   /// fires. A failed or empty read means the host is gone.
   async fn handle_handshake(self: Arc<Self>, client: Arc<Client>) {
      debug!("Start handling handshake for {}", client.device);

      let mut buf = [0u8; CONTROL_MTU];
      loop {
         let read = select! {
            biased;
            () = client.done.fired() => break,
            read = client.control.read(&mut buf) => read,
         };

         let header = match read {
            Ok(n) if n > 0 => buf[0],
            Ok(_) => {
               warn!("Control channel of {} closed by peer", client.device);
               break;
            },
            Err(e) => {
               warn!("Failed to read control channel of {}: {e}", client.device);
               break;
            },
         };

         match Transaction::from_header(header) {
            Some(transaction) => {
               debug!("Control from {}: {header:#04x} ({transaction})", client.device);
            },
            None => debug!("Control from {}: {header:#04x} (unsupported)", client.device),
         }

         if let Some(reply) = protocol::handshake_reply(header)
            && let Err(e) = client.control.write(&[reply])
         {
            debug!("Handshake reply to {} failed: {e}", client.device);
         }
      }

      if let Err(e) = self.disconnect_client(&client) {
         warn!("Error while disconnecting {}: {e}", client.device);
      }
      debug!("Exit handling handshake for {}", client.device);
   }
}
