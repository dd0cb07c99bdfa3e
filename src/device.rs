//! BlueZ [`Device`] access.

use core::fmt;
use std::collections::HashMap;

use zbus::zvariant::{Array, ObjectPath, OwnedObjectPath, OwnedValue};

use crate::{address::Address, Error, Result, Session};

mod private {
    use zbus::dbus_proxy;

    #[dbus_proxy(
        interface = "org.bluez.Device1",
        default_service = "org.bluez",
        assume_defaults = false
    )]
    trait Device {
        async fn connect(&self) -> zbus::Result<()>;
        async fn disconnect(&self) -> zbus::Result<()>;

        #[dbus_proxy(property)]
        fn connected(&self) -> zbus::Result<bool>;

        #[dbus_proxy(property)]
        fn address(&self) -> zbus::Result<String>;

        #[dbus_proxy(property)]
        fn name(&self) -> zbus::Result<String>;

        #[dbus_proxy(property)]
        fn alias(&self) -> zbus::Result<String>;

        #[dbus_proxy(property)]
        fn paired(&self) -> zbus::Result<bool>;

        #[dbus_proxy(property)]
        fn trusted(&self) -> zbus::Result<bool>;

        #[dbus_proxy(property)]
        fn set_trusted(&self, trusted: bool) -> zbus::Result<()>;
    }
}

use private::DeviceProxy;

/// Device properties the applet reacts to when they change.
pub(crate) const DEVICE_PROPERTIES: &[&str] = &["Alias", "Connected", "Paired", "Trusted", "UUIDs"];

/// A reference to a remote BlueZ device.
#[derive(Clone)]
pub struct Device {
    proxy: DeviceProxy<'static>,
}

impl Device {
    pub(crate) async fn new(session: Session, path: ObjectPath<'static>) -> Result<Self> {
        let proxy = DeviceProxy::new(&session.conn, path)
            .await
            .map_err(Error::from)?;
        Ok(Self { proxy })
    }

    /// Returns the hardware [`Address`] of the device.
    pub async fn address(&self) -> Result<Address> {
        let string = self.proxy.address().await.map_err(Error::from)?;
        string.parse().map_err(Error::from)
    }

    /// Returns the name the remote device reported for itself.
    ///
    /// Unlike [`Device::alias`], this fails for devices that never sent a
    /// name.
    pub async fn name(&self) -> Result<String> {
        self.proxy.name().await.map_err(Error::from)
    }

    /// Returns the user-friendly name assigned to the device.
    pub async fn alias(&self) -> Result<String> {
        self.proxy.alias().await.map_err(Error::from)
    }

    /// Returns whether the device has completed pairing.
    pub async fn is_paired(&self) -> Result<bool> {
        self.proxy.paired().await.map_err(Error::from)
    }

    /// Returns whether the device may use services without per-connection
    /// authorization.
    pub async fn is_trusted(&self) -> Result<bool> {
        self.proxy.trusted().await.map_err(Error::from)
    }

    /// Marks the device as trusted (or revokes that mark).
    ///
    /// Trusted devices skip the service authorization prompt on future
    /// connections.
    pub async fn set_trusted(&self, trusted: bool) -> Result<()> {
        self.proxy.set_trusted(trusted).await.map_err(Error::from)
    }

    /// Establishes a connection to the device.
    ///
    /// Does nothing if the adapter is already connected to the device.
    pub async fn connect(&self) -> Result<()> {
        // Connecting to a device we're already connected to can result in a cryptic
        // `le-connection-abort-by-local` error, so ensure that this call succeeds if the device is
        // already connected.
        if self.is_connected().await? {
            return Ok(());
        }

        match self.proxy.connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Connecting is racy, so check if we ended up connecting if it fails.
                if let Ok(true) = self.is_connected().await {
                    return Ok(());
                }
                return Err(Error::from(e));
            }
        }
    }

    /// Severs the connection to the device.
    ///
    /// Does nothing if the adapter is already disconnected from the device.
    pub async fn disconnect(&self) -> Result<()> {
        if !self.is_connected().await? {
            return Ok(());
        }

        match self.proxy.disconnect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Ok(false) = self.is_connected().await {
                    return Ok(());
                }
                return Err(Error::from(e));
            }
        }
    }

    /// Returns whether the adapter is currently connected to this device.
    pub async fn is_connected(&self) -> Result<bool> {
        self.proxy.connected().await.map_err(Error::from)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("path", self.proxy.path())
            .finish()
    }
}

// OBEX profile UUIDs, used to derive the device capability flags.
const OBEX_OBJECT_PUSH_UUID: &str = "00001105-0000-1000-8000-00805f9b34fb";
const OBEX_FILE_TRANSFER_UUID: &str = "00001106-0000-1000-8000-00805f9b34fb";

/// File exchange services a device advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub obex_push: bool,
    pub obex_file_transfer: bool,
}

impl Capabilities {
    fn from_uuids(uuids: &[String]) -> Self {
        Self {
            obex_push: has_uuid(uuids, OBEX_OBJECT_PUSH_UUID),
            obex_file_transfer: has_uuid(uuids, OBEX_FILE_TRANSFER_UUID),
        }
    }
}

fn has_uuid(uuids: &[String], uuid: &str) -> bool {
    uuids.iter().any(|u| u.eq_ignore_ascii_case(uuid))
}

/// A snapshot of the device state shown in the applet's device list.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Object path of the device; doubles as the token in [`AgentEvent`]s.
    ///
    /// [`AgentEvent`]: crate::AgentEvent
    pub path: String,
    pub address: Address,
    /// Display name (the alias, falling back to the reported name, falling
    /// back to the address).
    pub alias: String,
    /// Name the device reported for itself, if any.
    pub name: Option<String>,
    /// Icon name for the device class, if BlueZ derived one.
    pub icon: Option<String>,
    pub paired: bool,
    pub trusted: bool,
    pub connected: bool,
    pub legacy_pairing: bool,
    pub capabilities: Capabilities,
}

impl DeviceInfo {
    /// Builds a snapshot from an `org.bluez.Device1` property dictionary, as
    /// returned by `GetManagedObjects`.
    ///
    /// Returns `None` for entries without a valid address (removed or
    /// half-initialized objects).
    pub(crate) fn from_props(
        path: &OwnedObjectPath,
        props: &HashMap<String, OwnedValue>,
    ) -> Option<Self> {
        let address: Address = match prop_str(props, "Address").map(|s| s.parse()) {
            Some(Ok(address)) => address,
            _ => {
                log::debug!("skipping device {} without a valid address", path);
                return None;
            }
        };
        let name = prop_str(props, "Name");
        let alias = prop_str(props, "Alias")
            .or_else(|| name.clone())
            .unwrap_or_else(|| address.to_string());

        Some(Self {
            path: path.to_string(),
            address,
            alias,
            name,
            icon: prop_str(props, "Icon"),
            paired: prop_bool(props, "Paired").unwrap_or(false),
            trusted: prop_bool(props, "Trusted").unwrap_or(false),
            connected: prop_bool(props, "Connected").unwrap_or(false),
            legacy_pairing: prop_bool(props, "LegacyPairing").unwrap_or(false),
            capabilities: Capabilities::from_uuids(&prop_str_list(props, "UUIDs")),
        })
    }
}

pub(crate) fn prop_bool(props: &HashMap<String, OwnedValue>, name: &str) -> Option<bool> {
    props.get(name).and_then(|v| v.downcast_ref::<bool>().copied())
}

pub(crate) fn prop_str(props: &HashMap<String, OwnedValue>, name: &str) -> Option<String> {
    props
        .get(name)
        .and_then(|v| v.downcast_ref::<str>().map(ToOwned::to_owned))
}

fn prop_str_list(props: &HashMap<String, OwnedValue>, name: &str) -> Vec<String> {
    match props.get(name).and_then(|v| v.downcast_ref::<Array>()) {
        Some(array) => array
            .get()
            .iter()
            .filter_map(|v| v.downcast_ref::<str>().map(ToOwned::to_owned))
            .collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use zbus::zvariant::Value;

    use super::*;

    fn path(s: &str) -> OwnedObjectPath {
        ObjectPath::try_from(s).unwrap().into()
    }

    fn str_value(s: &str) -> OwnedValue {
        OwnedValue::from(Value::from(s.to_string()))
    }

    fn strv_value(items: &[&str]) -> OwnedValue {
        let vec: Vec<String> = items.iter().map(|s| s.to_string()).collect();
        OwnedValue::from(Value::from(Array::from(vec)))
    }

    #[test]
    fn snapshot_from_props() {
        let mut props = HashMap::new();
        props.insert("Address".to_string(), str_value("AA:BB:CC:11:22:33"));
        props.insert("Name".to_string(), str_value("Headphones"));
        props.insert("Alias".to_string(), str_value("My Headphones"));
        props.insert("Connected".to_string(), OwnedValue::from(Value::from(true)));
        props.insert(
            "UUIDs".to_string(),
            strv_value(&[OBEX_OBJECT_PUSH_UUID, "0000110b-0000-1000-8000-00805f9b34fb"]),
        );

        let info = DeviceInfo::from_props(&path("/org/bluez/hci0/dev_AA_BB_CC_11_22_33"), &props)
            .unwrap();
        assert_eq!(info.address.to_string(), "AA:BB:CC:11:22:33");
        assert_eq!(info.alias, "My Headphones");
        assert_eq!(info.name.as_deref(), Some("Headphones"));
        assert!(info.connected);
        assert!(!info.paired);
        assert!(info.capabilities.obex_push);
        assert!(!info.capabilities.obex_file_transfer);
    }

    #[test]
    fn alias_falls_back_to_address() {
        let mut props = HashMap::new();
        props.insert("Address".to_string(), str_value("AA:BB:CC:11:22:33"));

        let info = DeviceInfo::from_props(&path("/org/bluez/hci0/dev_AA_BB_CC_11_22_33"), &props)
            .unwrap();
        assert_eq!(info.alias, "AA:BB:CC:11:22:33");
        assert_eq!(info.name, None);
    }

    #[test]
    fn invalid_address_is_skipped() {
        let mut props = HashMap::new();
        props.insert("Address".to_string(), str_value("not-an-address"));
        assert!(DeviceInfo::from_props(&path("/org/bluez/hci0/dev_0"), &props).is_none());
        assert!(DeviceInfo::from_props(&path("/org/bluez/hci0/dev_0"), &HashMap::new()).is_none());
    }

    #[test]
    fn uuid_comparison_ignores_case() {
        let uuids = vec![OBEX_FILE_TRANSFER_UUID.to_uppercase()];
        let caps = Capabilities::from_uuids(&uuids);
        assert!(caps.obex_file_transfer);
        assert!(!caps.obex_push);
    }
}
