//! USB keyboard access, HIDP framing and the keyboard relay.

pub mod device;
pub mod keyboard;
pub mod protocol;
