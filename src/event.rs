//! Connection events produced by the broker and consumed by the relay.
//!
//! A [`Client`] is one logical Bluetooth HID session: the two L2CAP
//! channels plus the signal that stops the loops serving it.

use std::fmt;

use smol_str::SmolStr;
use tokio::sync::{mpsc, watch};

use crate::{
   bluetooth::l2cap::L2capSocket,
   error::{KbdError, Result},
};

/// Host-assigned identity of a remote device (its BlueZ object path).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(SmolStr);

impl DeviceId {
   pub fn new(id: impl AsRef<str>) -> Self {
      Self(SmolStr::new(id))
   }
}

impl fmt::Display for DeviceId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

/// One-shot signal, fired at most once.
#[derive(Debug)]
pub struct DoneSignal {
   tx: watch::Sender<bool>,
}

impl Default for DoneSignal {
   fn default() -> Self {
      Self::new()
   }
}

impl DoneSignal {
   pub fn new() -> Self {
      let (tx, _) = watch::channel(false);
      Self { tx }
   }

   /// Fires the signal. Returns `false` if it had already fired.
   pub fn fire(&self) -> bool {
      self.tx.send_if_modified(|done| !std::mem::replace(done, true))
   }

   pub fn is_fired(&self) -> bool {
      *self.tx.borrow()
   }

   /// Resolves once the signal has fired.
   pub async fn fired(&self) {
      let mut rx = self.tx.subscribe();
      let _ = rx.wait_for(|done| *done).await;
   }
}

/// A connected Bluetooth HID host.
#[derive(Debug)]
pub struct Client {
   pub device: DeviceId,
   pub control: L2capSocket,
   pub interrupt: L2capSocket,
   pub done: DoneSignal,
}

impl Client {
   pub fn new(device: DeviceId, control: L2capSocket, interrupt: L2capSocket) -> Self {
      Self {
         device,
         control,
         interrupt,
         done: DoneSignal::new(),
      }
   }

   /// Closes both channels, returning the first close error.
   pub fn close(&self) -> Result<()> {
      let control = self.control.close();
      let interrupt = self.interrupt.close();
      control.and(interrupt)
   }
}

/// Receiving ends of the broker's two event streams.
#[derive(Debug)]
pub struct BrokerEvents {
   pub connections: mpsc::Receiver<Client>,
   pub disconnections: mpsc::Receiver<DeviceId>,
}

/// Sending ends of the broker's two event streams.
#[derive(Debug, Clone)]
pub struct EventSender {
   connections: mpsc::Sender<Client>,
   disconnections: mpsc::Sender<DeviceId>,
}

impl EventSender {
   pub fn channel(capacity: usize) -> (Self, BrokerEvents) {
      let (conn_tx, conn_rx) = mpsc::channel(capacity);
      let (disc_tx, disc_rx) = mpsc::channel(capacity);
      (
         Self {
            connections: conn_tx,
            disconnections: disc_tx,
         },
         BrokerEvents {
            connections: conn_rx,
            disconnections: disc_rx,
         },
      )
   }

   pub async fn connected(&self, client: Client) -> Result<()> {
      self
         .connections
         .send(client)
         .await
         .map_err(|_| KbdError::BrokerShutdown)
   }

   pub async fn disconnected(&self, device: DeviceId) -> Result<()> {
      self
         .disconnections
         .send(device)
         .await
         .map_err(|_| KbdError::BrokerShutdown)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_done_signal_fires_once() {
      let done = DoneSignal::new();
      assert!(!done.is_fired());
      assert!(done.fire());
      assert!(done.is_fired());
      assert!(!done.fire());
      assert!(done.is_fired());
   }

   #[tokio::test]
   async fn test_done_signal_wakes_waiter() {
      let done = std::sync::Arc::new(DoneSignal::new());
      let waiter = {
         let done = done.clone();
         tokio::spawn(async move { done.fired().await })
      };
      tokio::task::yield_now().await;
      done.fire();
      waiter.await.unwrap();

      // Already fired resolves immediately
      done.fired().await;
   }

   #[test]
   fn test_device_id_display() {
      let id = DeviceId::new("/org/bluez/hci0/dev_10_20_30_40_50_60");
      assert_eq!(id.to_string(), "/org/bluez/hci0/dev_10_20_30_40_50_60");
      assert_eq!(id, DeviceId::new(id.to_string()));
   }
}
