//! BlueZ XML service record for the HID keyboard profile.

use std::fmt::Write as _;

use crate::{
   config::Config,
   hid::protocol::{PSM_CONTROL, PSM_INTERRUPT},
};

/// Text attributes of the service record.
#[derive(Debug, Clone, Copy)]
pub struct ServiceNames<'a> {
   pub name: &'a str,
   pub description: &'a str,
   pub provider: &'a str,
}

impl<'a> ServiceNames<'a> {
   pub fn from_config(config: &'a Config) -> Self {
      Self {
         name: &config.service_name,
         description: &config.service_description,
         provider: &config.provider_name,
      }
   }
}

/// HID service class
const UUID_HID: u16 = 0x1124;
/// L2CAP protocol
const UUID_L2CAP: u16 = 0x0100;
/// HIDP protocol
const UUID_HIDP: u16 = 0x0011;
/// Public browse group
const UUID_PUBLIC_BROWSE: u16 = 0x1002;

/// Report descriptor type in `HIDDescriptorList`
const DESCRIPTOR_TYPE_REPORT: u8 = 0x22;
/// Keyboard, no pointing device
const DEVICE_SUBCLASS_KEYBOARD: u8 = 0x40;

/// Renders the record passed as `ServiceRecord` to `RegisterProfile`, with
/// `descriptor` embedded hex-encoded as the report descriptor.
pub fn hid_keyboard_record(descriptor: &[u8], names: ServiceNames<'_>) -> String {
   let mut xml = String::with_capacity(4096);
   xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\" ?>\n<record>\n");

   attr(&mut xml, 0x0001, &seq(&uuid16(UUID_HID)));
   attr(
      &mut xml,
      0x0004,
      &seq(&format!(
         "{}{}",
         seq(&format!("{}{}", uuid16(UUID_L2CAP), uint16(PSM_CONTROL))),
         seq(&uuid16(UUID_HIDP))
      )),
   );
   attr(&mut xml, 0x0005, &seq(&uuid16(UUID_PUBLIC_BROWSE)));
   // Language base: "en", UTF-8 (MIBenum 106), offset 0x0100
   attr(
      &mut xml,
      0x0006,
      &seq(&format!("{}{}{}", uint16(0x656e), uint16(0x006a), uint16(0x0100))),
   );
   attr(
      &mut xml,
      0x0009,
      &seq(&seq(&format!("{}{}", uuid16(UUID_HID), uint16(0x0100)))),
   );
   attr(
      &mut xml,
      0x000d,
      &seq(&seq(&format!(
         "{}{}",
         seq(&format!("{}{}", uuid16(UUID_L2CAP), uint16(PSM_INTERRUPT))),
         seq(&uuid16(UUID_HIDP))
      ))),
   );

   attr(&mut xml, 0x0100, &text(names.name));
   attr(&mut xml, 0x0101, &text(names.description));
   attr(&mut xml, 0x0102, &text(names.provider));

   attr(&mut xml, 0x0200, &uint16(0x0100));
   attr(&mut xml, 0x0201, &uint16(0x0111));
   attr(&mut xml, 0x0202, &uint8(DEVICE_SUBCLASS_KEYBOARD));
   attr(&mut xml, 0x0203, &uint8(0x00));
   attr(&mut xml, 0x0204, &boolean(true));
   attr(&mut xml, 0x0205, &boolean(true));
   attr(
      &mut xml,
      0x0206,
      &seq(&seq(&format!(
         "{}<text encoding=\"hex\" value=\"{}\" />",
         uint8(DESCRIPTOR_TYPE_REPORT),
         hex::encode(descriptor)
      ))),
   );
   attr(
      &mut xml,
      0x0207,
      &seq(&seq(&format!("{}{}", uint16(0x0409), uint16(0x0100)))),
   );
   attr(&mut xml, 0x020b, &uint16(0x0100));
   attr(&mut xml, 0x020c, &uint16(0x0c80));
   attr(&mut xml, 0x020d, &boolean(false));
   attr(&mut xml, 0x020e, &boolean(true));
   attr(&mut xml, 0x020f, &uint16(0x0640));
   attr(&mut xml, 0x0210, &uint16(0x0320));

   xml.push_str("</record>\n");
   xml
}

fn attr(xml: &mut String, id: u16, body: &str) {
   let _ = writeln!(xml, "<attribute id=\"{id:#06x}\">{body}</attribute>");
}

fn seq(body: &str) -> String {
   format!("<sequence>{body}</sequence>")
}

fn uuid16(value: u16) -> String {
   format!("<uuid value=\"{value:#06x}\" />")
}

fn uint8(value: u8) -> String {
   format!("<uint8 value=\"{value:#04x}\" />")
}

fn uint16(value: u16) -> String {
   format!("<uint16 value=\"{value:#06x}\" />")
}

fn boolean(value: bool) -> String {
   format!("<boolean value=\"{value}\" />")
}

fn text(value: &str) -> String {
   format!("<text value=\"{}\" />", escape(value))
}

fn escape(value: &str) -> String {
   let mut out = String::with_capacity(value.len());
   for c in value.chars() {
      match c {
         '&' => out.push_str("&amp;"),
         '<' => out.push_str("&lt;"),
         '>' => out.push_str("&gt;"),
         '"' => out.push_str("&quot;"),
         '\'' => out.push_str("&apos;"),
         c => out.push(c),
      }
   }
   out
}
