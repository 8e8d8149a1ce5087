//! HIDP (HID over L2CAP) protocol definitions.
//!
//! Every HIDP message starts with a one-byte header whose high nibble is the
//! transaction type and whose low nibble is a type-specific parameter.

use crate::bluetooth::l2cap::Packet;

/// PSM of the HID control channel.
pub const PSM_CONTROL: u16 = 0x11;
/// PSM of the HID interrupt channel.
pub const PSM_INTERRUPT: u16 = 0x13;

/// Largest control message accepted.
pub const CONTROL_MTU: usize = 1024;

pub const HEADER_TRANS_MASK: u8 = 0xf0;

pub const HANDSHAKE_SUCCESSFUL: u8 = 0x00;
pub const HANDSHAKE_ERR_UNKNOWN: u8 = 0x0e;

/// DATA header for an input report (`DATA | INPUT`).
pub const HEADER_DATA_INPUT: u8 = 0xa1;

/// Frames sent on the control channel once a host is connected.
pub const PKT_HELLO: [&[u8]; 2] = [&[0xa1, 0x13, 0x03], &[0xa1, 0x13, 0x02]];

/// Transaction types the relay distinguishes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum Transaction {
   Handshake = 0x00,
   SetProtocol = 0x60,
   Data = 0xa0,
}

impl Transaction {
   /// Decodes the transaction type of a header byte, `None` for types the
   /// relay does not handle.
   pub fn from_header(header: u8) -> Option<Self> {
      Self::from_repr(header & HEADER_TRANS_MASK)
   }

   /// Header byte of this transaction with the given parameter nibble.
   pub const fn header(self, param: u8) -> u8 {
      self as u8 | (param & !HEADER_TRANS_MASK)
   }
}

/// Reply owed for a control message starting with `header`, if any.
///
/// SET_PROTOCOL is acknowledged, DATA needs no answer, everything else is
/// answered with an unknown-error handshake.
pub fn handshake_reply(header: u8) -> Option<u8> {
   match Transaction::from_header(header) {
      Some(Transaction::SetProtocol) => {
         Some(Transaction::Handshake.header(HANDSHAKE_SUCCESSFUL))
      },
      Some(Transaction::Data) => None,
      _ => Some(Transaction::Handshake.header(HANDSHAKE_ERR_UNKNOWN)),
   }
}

/// Frames a USB input report for the interrupt channel.
pub fn input_frame(report: &[u8]) -> Packet {
   let mut frame = Packet::with_capacity(report.len() + 1);
   frame.push(HEADER_DATA_INPUT);
   frame.extend_from_slice(report);
   frame
}
