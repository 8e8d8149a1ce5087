//! L2CAP socket address packing.
//!
//! The kernel's `sockaddr_l2` has no libc binding, so the address is packed
//! by hand into the leading bytes of that structure:
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 2    | address family (`AF_BLUETOOTH`, LE)     |
//! | 2      | 2    | PSM (LE)                                |
//! | 4      | 6    | device address (`bdaddr_t`, LSB first)  |
//!
//! The trailing CID and address type fields are left to the kernel, which
//! zero-fills them when a shorter address length is passed.

use std::fmt;

use bluer::Address;

use crate::error::{KbdError, Result};

/// Size in bytes of the packed address.
pub const SOCKADDR_L2_LEN: usize = 10;

/// Raw packed form of [`SockAddrL2`].
pub type RawSockAddrL2 = [u8; SOCKADDR_L2_LEN];

/// An L2CAP endpoint: PSM plus device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SockAddrL2 {
   pub psm: u16,
   pub bdaddr: Address,
}

impl SockAddrL2 {
   pub const fn new(psm: u16, bdaddr: Address) -> Self {
      Self { psm, bdaddr }
   }

   /// Wildcard address on the given PSM, used for binding listeners.
   pub const fn any(psm: u16) -> Self {
      Self::new(psm, Address::any())
   }

   pub fn pack(&self) -> RawSockAddrL2 {
      let mut raw = [0u8; SOCKADDR_L2_LEN];
      raw[0..2].copy_from_slice(&(libc::AF_BLUETOOTH as u16).to_le_bytes());
      raw[2..4].copy_from_slice(&self.psm.to_le_bytes());
      for (dst, src) in raw[4..].iter_mut().zip(self.bdaddr.0.iter().rev()) {
         *dst = *src;
      }
      raw
   }

   pub fn unpack(raw: &RawSockAddrL2) -> Result<Self> {
      let family = u16::from_le_bytes([raw[0], raw[1]]);
      if family != libc::AF_BLUETOOTH as u16 {
         return Err(KbdError::InvalidAddress(format!(
            "address family {family} is not AF_BLUETOOTH"
         )));
      }

      let mut bdaddr = [0u8; 6];
      for (dst, src) in bdaddr.iter_mut().zip(raw[4..].iter().rev()) {
         *dst = *src;
      }

      Ok(Self::new(
         u16::from_le_bytes([raw[2], raw[3]]),
         Address::new(bdaddr),
      ))
   }
}

impl fmt::Display for SockAddrL2 {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "[PSM: {:#06x}, Bdaddr: {}]", self.psm, self.bdaddr)
   }
}
