//! `org.bluez.Profile1` implementation and profile registration.

use std::{
   collections::HashMap,
   os::fd::{IntoRawFd, OwnedFd},
   sync::Arc,
};

use log::{debug, error, info};
use uuid::Uuid;
use zbus::{
   Connection, interface, proxy,
   zvariant::{self, ObjectPath, OwnedObjectPath, OwnedValue, Value},
};

use crate::{
   bluetooth::broker::ConnectionBroker,
   error::{KbdError, Result},
   event::DeviceId,
   hid::protocol::PSM_CONTROL,
};

#[proxy(
   interface = "org.bluez.ProfileManager1",
   default_service = "org.bluez",
   default_path = "/org/bluez"
)]
trait ProfileManager1 {
   fn register_profile(
      &self,
      profile: &ObjectPath<'_>,
      uuid: &str,
      options: HashMap<&str, Value<'_>>,
   ) -> zbus::Result<()>;

   fn unregister_profile(&self, profile: &ObjectPath<'_>) -> zbus::Result<()>;
}

/// Profile object BlueZ calls back into when a host connects the control PSM.
pub struct HidProfile {
   broker: Arc<ConnectionBroker>,
}

impl HidProfile {
   pub const fn new(broker: Arc<ConnectionBroker>) -> Self {
      Self { broker }
   }
}

#[interface(name = "org.bluez.Profile1")]
impl HidProfile {
   async fn release(&self) {
      debug!("Profile released");
   }

   async fn new_connection(
      &self,
      device: OwnedObjectPath,
      fd: zvariant::OwnedFd,
      fd_properties: HashMap<String, OwnedValue>,
   ) -> zbus::fdo::Result<()> {
      debug!(
         "NewConnection {} {:?}",
         device.as_str(),
         fd_properties.keys().collect::<Vec<_>>()
      );

      let fd = OwnedFd::from(fd).into_raw_fd();
      self
         .broker
         .on_control_channel_established(DeviceId::new(device.as_str()), fd)
         .await
         .map_err(|e| {
            error!("Refusing connection from {}: {e}", device.as_str());
            zbus::fdo::Error::Failed(e.to_string())
         })
   }

   async fn request_disconnection(&self, device: OwnedObjectPath) -> zbus::fdo::Result<()> {
      self
         .broker
         .on_disconnection_requested(DeviceId::new(device.as_str()))
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }
}

/// Registers the profile exported at `path` with BlueZ.
///
/// The control PSM is claimed through the profile options; BlueZ hands its
/// connections to [`HidProfile`] and requires the host to be paired and
/// authorized first.
pub async fn register(conn: &Connection, path: &str, uuid: &str, record: &str) -> Result<()> {
   let uuid = Uuid::parse_str(uuid)
      .map_err(|_| KbdError::InvalidArgument("profile uuid is not a valid UUID"))?;
   let path = ObjectPath::try_from(path).map_err(zbus::Error::from)?;

   let options = HashMap::from([
      ("PSM", Value::from(PSM_CONTROL)),
      ("RequireAuthentication", Value::from(true)),
      ("RequireAuthorization", Value::from(true)),
      ("ServiceRecord", Value::from(record)),
   ]);

   ProfileManager1Proxy::new(conn)
      .await?
      .register_profile(&path, &uuid.hyphenated().to_string(), options)
      .await?;
   info!("Registered HID profile {uuid} at {path}");
   Ok(())
}

pub async fn unregister(conn: &Connection, path: &str) -> Result<()> {
   let path = ObjectPath::try_from(path).map_err(zbus::Error::from)?;
   ProfileManager1Proxy::new(conn)
      .await?
      .unregister_profile(&path)
      .await?;
   info!("Unregistered HID profile at {path}");
   Ok(())
}
