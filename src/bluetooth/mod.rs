//! Bluetooth side of the relay: L2CAP sockets, the connection broker and
//! BlueZ profile registration.

pub mod adapter;
pub mod addr;
pub mod broker;
pub mod l2cap;
pub mod profile;
pub mod sdp;
pub mod sys;
