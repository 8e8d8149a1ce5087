//! USB keyboard access through hidapi.

use std::time::Duration;

use hidapi::{HidApi, HidDevice};
use log::{debug, info};

use crate::{
   bluetooth::l2cap::Packet,
   error::{KbdError, Result},
};

/// Generic Desktop usage page
const USAGE_PAGE_GENERIC_DESKTOP: u16 = 0x01;
/// Keyboard usage within the Generic Desktop page
const USAGE_KEYBOARD: u16 = 0x06;
/// Upper bound of a HID report descriptor
const MAX_REPORT_DESCRIPTOR_SIZE: usize = 4096;
/// Largest input report read from the device
const MAX_REPORT_SIZE: usize = 64;

/// A source of raw HID input reports.
pub trait ReportSource: Send {
   /// Reads one input report. Returns `Ok(None)` if `timeout` elapsed
   /// without a report, which is the normal idle case.
   fn read_report(&mut self, timeout: Duration) -> Result<Option<Packet>>;
}

/// The first USB keyboard found on the system.
pub struct UsbKeyboard {
   device: HidDevice,
   descriptor: Vec<u8>,
}

impl UsbKeyboard {
   /// Opens the first HID interface that reports the keyboard usage and
   /// caches its report descriptor.
   pub fn open_first() -> Result<Self> {
      let api = HidApi::new()?;
      let info = api
         .device_list()
         .find(|info| {
            info.usage_page() == USAGE_PAGE_GENERIC_DESKTOP && info.usage() == USAGE_KEYBOARD
         })
         .ok_or(KbdError::DeviceNotFound)?;

      info!(
         "Using keyboard {:04x}:{:04x} {}",
         info.vendor_id(),
         info.product_id(),
         info.product_string().unwrap_or("(unnamed)")
      );

      let device = info.open_device(&api)?;

      let mut buf = vec![0u8; MAX_REPORT_DESCRIPTOR_SIZE];
      let n = device.get_report_descriptor(&mut buf)?;
      buf.truncate(n);
      debug!("Report descriptor: {}", hex::encode(&buf));

      Ok(Self {
         device,
         descriptor: buf,
      })
   }

   pub fn descriptor(&self) -> &[u8] {
      &self.descriptor
   }
}

impl ReportSource for UsbKeyboard {
   fn read_report(&mut self, timeout: Duration) -> Result<Option<Packet>> {
      let mut buf = [0u8; MAX_REPORT_SIZE];
      let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
      match self.device.read_timeout(&mut buf, millis)? {
         0 => Ok(None),
         n => Ok(Some(Packet::from_slice(&buf[..n]))),
      }
   }
}
