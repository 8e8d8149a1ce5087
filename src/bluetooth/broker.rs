//! Pairs BlueZ-delivered control channels with locally accepted interrupt
//! channels.
//!
//! BlueZ terminates the control PSM itself and hands the descriptor over
//! through `Profile1.NewConnection`; the interrupt PSM is listened on here.
//! A remote host always opens the interrupt channel right after the control
//! channel, so each control descriptor is matched with the next accepted
//! interrupt connection.

use std::os::fd::RawFd;

use log::{debug, error, info};

use crate::{
   bluetooth::l2cap::{L2capSocket, SocketContext},
   error::Result,
   event::{BrokerEvents, Client, DeviceId, EventSender},
   hid::protocol::PSM_INTERRUPT,
};

/// Capacity of each outbound event stream
const CHANNEL_BUFFER_SIZE: usize = 8;

pub struct ConnectionBroker {
   ctx: SocketContext,
   interrupt: L2capSocket,
   events: EventSender,
}

impl ConnectionBroker {
   /// Starts listening on the interrupt PSM (backlog 1, non-blocking).
   pub fn new(ctx: SocketContext) -> Result<(Self, BrokerEvents)> {
      let interrupt = ctx.listen(PSM_INTERRUPT, 1, false)?;
      if let Some(local) = interrupt.local_addr() {
         info!("Listening for interrupt channels on {local}");
      }

      let (events, streams) = EventSender::channel(CHANNEL_BUFFER_SIZE);
      Ok((
         Self {
            ctx,
            interrupt,
            events,
         },
         streams,
      ))
   }

   /// Handles a control channel opened by `device`.
   ///
   /// Blocks until the matching interrupt connection is accepted. An accept
   /// failure closes the listener for good and is returned, so the caller can
   /// refuse the connection.
   pub async fn on_control_channel_established(
      &self,
      device: DeviceId,
      control_fd: RawFd,
   ) -> Result<()> {
      debug!("Control channel from {device} on fd {control_fd}");

      let interrupt = match self.interrupt.accept().await {
         Ok(socket) => socket,
         Err(e) => {
            error!("Accept on PSM {PSM_INTERRUPT:#06x} failed: {e}");
            let _ = self.ctx.close_raw(control_fd);
            let _ = self.interrupt.close();
            return Err(e);
         },
      };
      if let Some(peer) = interrupt.peer_addr() {
         info!("Interrupt channel accepted for {device} from {peer}");
      }

      let control = self.ctx.wrap(control_fd)?;
      info!("Control channel wrapped for {device}");

      self
         .events
         .connected(Client::new(device, control, interrupt))
         .await
   }

   /// Forwards a disconnection request for `device`.
   pub async fn on_disconnection_requested(&self, device: DeviceId) -> Result<()> {
      info!("Disconnection requested by {device}");
      self.events.disconnected(device).await
   }
}

#[cfg(test)]
mod tests {
   use std::{sync::Arc, time::Duration};

   use super::*;
   use crate::{
      bluetooth::{
         addr::SockAddrL2,
         l2cap::RetryPolicy,
         sys::mock::{MockKernel, peer},
      },
      error::KbdError,
   };

   fn broker(kernel: &Arc<MockKernel>) -> (ConnectionBroker, BrokerEvents, RawFd) {
      let ctx = SocketContext::new(
         kernel.clone(),
         RetryPolicy {
            delay: Duration::ZERO,
         },
      );
      let (broker, events) = ConnectionBroker::new(ctx).unwrap();
      let listener = broker.interrupt.raw_fd().unwrap();
      (broker, events, listener)
   }

   #[test]
   fn test_listens_on_interrupt_psm() {
      let kernel = MockKernel::new();
      let (broker, _events, listener) = broker(&kernel);

      assert_eq!(broker.interrupt.local_addr(), Some(SockAddrL2::any(0x13)));
      assert!(broker.interrupt.peer_addr().is_none());
      let (bound, backlog) = kernel.bound(listener).unwrap();
      assert_eq!(bound, SockAddrL2::any(0x13));
      assert_eq!(backlog, Some(1));
      assert!(kernel.is_nonblocking(listener));
   }

   #[tokio::test]
   async fn test_control_channel_yields_client() {
      let kernel = MockKernel::new();
      let (broker, mut events, listener) = broker(&kernel);

      kernel.push_accept_error(listener, libc::EAGAIN);
      let intr_fd = kernel.push_accept(listener, peer(0x13));
      let ctrl_fd = kernel.external_fd(SockAddrL2::new(0x11, peer(0x13).bdaddr));

      let device = DeviceId::new("/org/bluez/hci0/dev_10_20_30_40_50_13");
      broker
         .on_control_channel_established(device.clone(), ctrl_fd)
         .await
         .unwrap();

      let client = events.connections.recv().await.unwrap();
      assert_eq!(client.device, device);
      assert_eq!(client.control.raw_fd(), Some(ctrl_fd));
      assert_eq!(client.interrupt.raw_fd(), Some(intr_fd));
      assert_eq!(client.control.peer_addr().unwrap().psm, 0x11);
      assert!(!client.done.is_fired());
   }

   #[tokio::test]
   async fn test_accept_failure_closes_listener() {
      let kernel = MockKernel::new();
      let (broker, mut events, listener) = broker(&kernel);

      kernel.push_accept_error(listener, libc::EINVAL);
      let ctrl_fd = kernel.external_fd(peer(1));

      let result = broker
         .on_control_channel_established(DeviceId::new("/dev_a"), ctrl_fd)
         .await;
      assert!(result.is_err());
      assert!(kernel.is_closed(listener));
      assert!(kernel.is_closed(ctrl_fd));
      assert!(events.connections.try_recv().is_err());

      // The listener stays dead
      let ctrl_fd = kernel.external_fd(peer(2));
      let result = broker
         .on_control_channel_established(DeviceId::new("/dev_b"), ctrl_fd)
         .await;
      assert!(matches!(result, Err(KbdError::InvalidArgument(_))));
   }

   #[tokio::test]
   async fn test_disconnection_is_forwarded() {
      let kernel = MockKernel::new();
      let (broker, mut events, _) = broker(&kernel);

      broker
         .on_disconnection_requested(DeviceId::new("/dev_a"))
         .await
         .unwrap();
      assert_eq!(
         events.disconnections.recv().await,
         Some(DeviceId::new("/dev_a"))
      );
   }

   #[tokio::test]
   async fn test_closed_streams_report_shutdown() {
      let kernel = MockKernel::new();
      let (broker, events, _) = broker(&kernel);
      drop(events);

      assert!(matches!(
         broker.on_disconnection_requested(DeviceId::new("/dev_a")).await,
         Err(KbdError::BrokerShutdown)
      ));
   }
}
