//! BlueZ [`Adapter`] access.

use std::collections::HashMap;

use zbus::{
    dbus_proxy,
    zvariant::{ObjectPath, OwnedObjectPath, OwnedValue},
};

use crate::{address::Address, device::prop_bool, Error, Result, Session};

#[dbus_proxy(
    interface = "org.bluez.Adapter1",
    default_service = "org.bluez",
    assume_defaults = false
)]
trait Adapter {
    #[dbus_proxy(property)]
    fn address(&self) -> zbus::Result<String>;

    #[dbus_proxy(property)]
    fn powered(&self) -> zbus::Result<bool>;

    #[dbus_proxy(property)]
    fn set_powered(&self, powered: bool) -> zbus::Result<()>;

    #[dbus_proxy(property)]
    fn discoverable(&self) -> zbus::Result<bool>;

    #[dbus_proxy(property)]
    fn set_discoverable(&self, discoverable: bool) -> zbus::Result<()>;
}

/// Adapter properties the applet reacts to when they change.
pub(crate) const ADAPTER_PROPERTIES: &[&str] = &["Powered", "Discoverable"];

/// A BlueZ Bluetooth adapter.
pub struct Adapter {
    name: String,
    proxy: AdapterProxy<'static>,
}

impl Adapter {
    const PATH_PREFIX: &str = "/org/bluez/";

    /// Opens the system's default Bluetooth adapter.
    ///
    /// The default adapter is the first *powered* adapter, in name order
    /// (`hci0` before `hci1`).
    pub async fn open(session: &Session) -> Result<Self> {
        let mut adapters = Self::enumerate(session).await?.collect::<Vec<_>>();
        adapters.sort_by(|a, b| a.name.cmp(&b.name));

        for adapter in adapters {
            if adapter.is_powered().await? {
                return Ok(adapter);
            }
        }
        Err(Error::from("no powered adapter found"))
    }

    /// Returns an iterator yielding all Bluetooth adapters on the system.
    pub async fn enumerate(session: &Session) -> Result<impl Iterator<Item = Self>> {
        log::debug!(
            "enumerating BlueZ adapters on connection {}",
            session.conn.server_guid()
        );

        let manager = session.object_manager().await?;
        let objects = manager.get_managed_objects().await.map_err(Error::from)?;
        let mut paths = objects
            .iter()
            .filter(|(_, intfs)| intfs.contains_key("org.bluez.Adapter1"))
            .map(|(path, _)| path.clone())
            .collect::<Vec<_>>();
        paths.sort_by(|a, b| a.as_str().cmp(b.as_str()));

        let mut adapters = Vec::new();
        for path in paths {
            match Self::at(session, &path).await {
                Ok(adapter) => adapters.push(adapter),
                Err(e) => log::error!("failed to open adapter {}: {}", path, e),
            }
        }

        Ok(adapters.into_iter())
    }

    /// Opens the adapter at a known object path.
    pub(crate) async fn at(session: &Session, path: &ObjectPath<'_>) -> Result<Self> {
        let name = path
            .strip_prefix(Self::PATH_PREFIX)
            .unwrap_or(path.as_str())
            .to_string();
        let proxy = AdapterProxy::new(&session.conn, path.to_owned())
            .await
            .map_err(Error::from)?;
        Ok(Self { name, proxy })
    }

    /// Returns the adapter's device name (eg. `hci0`).
    pub fn device_name(&self) -> &str {
        &self.name
    }

    /// Returns the Bluetooth device [`Address`] of this [`Adapter`].
    pub async fn address(&self) -> Result<Address> {
        let string = self.proxy.address().await.map_err(Error::from)?;
        string.parse().map_err(Error::from)
    }

    /// Returns whether the adapter radio is powered on.
    pub async fn is_powered(&self) -> Result<bool> {
        self.proxy.powered().await.map_err(Error::from)
    }

    /// Powers the adapter radio on or off.
    pub async fn set_powered(&self, powered: bool) -> Result<()> {
        self.proxy.set_powered(powered).await.map_err(Error::from)
    }

    /// Returns whether the adapter is visible to other devices.
    pub async fn is_discoverable(&self) -> Result<bool> {
        self.proxy.discoverable().await.map_err(Error::from)
    }

    /// Makes the adapter visible (or invisible) to other devices.
    pub async fn set_discoverable(&self, discoverable: bool) -> Result<()> {
        self.proxy
            .set_discoverable(discoverable)
            .await
            .map_err(Error::from)
    }
}

/// Adapter state captured from one `GetManagedObjects` round trip.
#[derive(Debug, Clone)]
pub(crate) struct AdapterSnapshot {
    pub path: OwnedObjectPath,
    pub powered: bool,
    pub discoverable: bool,
}

impl AdapterSnapshot {
    pub(crate) fn from_props(path: OwnedObjectPath, props: &HashMap<String, OwnedValue>) -> Self {
        Self {
            powered: prop_bool(props, "Powered").unwrap_or(false),
            discoverable: prop_bool(props, "Discoverable").unwrap_or(false),
            path,
        }
    }
}

/// Picks the adapter the applet treats as default: the first powered one in
/// path order.
pub(crate) fn pick_default(adapters: &[AdapterSnapshot]) -> Option<&AdapterSnapshot> {
    adapters
        .iter()
        .filter(|a| a.powered)
        .min_by(|a, b| a.path.as_str().cmp(b.path.as_str()))
}

#[cfg(test)]
mod tests {
    use zbus::zvariant::Value;

    use super::*;

    fn path(s: &str) -> OwnedObjectPath {
        ObjectPath::try_from(s).unwrap().into()
    }

    fn snapshot(p: &str, powered: bool) -> AdapterSnapshot {
        AdapterSnapshot {
            path: path(p),
            powered,
            discoverable: false,
        }
    }

    #[test]
    fn snapshot_from_props() {
        let mut props = HashMap::new();
        props.insert("Powered".to_string(), OwnedValue::from(Value::from(true)));
        props.insert(
            "Discoverable".to_string(),
            OwnedValue::from(Value::from(false)),
        );

        let snap = AdapterSnapshot::from_props(path("/org/bluez/hci0"), &props);
        assert!(snap.powered);
        assert!(!snap.discoverable);

        // Missing properties are treated as "off".
        let snap = AdapterSnapshot::from_props(path("/org/bluez/hci1"), &HashMap::new());
        assert!(!snap.powered);
        assert!(!snap.discoverable);
    }

    #[test]
    fn default_is_first_powered() {
        let adapters = [
            snapshot("/org/bluez/hci1", true),
            snapshot("/org/bluez/hci0", false),
            snapshot("/org/bluez/hci2", true),
        ];
        let default = pick_default(&adapters).unwrap();
        assert_eq!(default.path.as_str(), "/org/bluez/hci1");
    }

    #[test]
    fn no_default_without_power() {
        let adapters = [
            snapshot("/org/bluez/hci0", false),
            snapshot("/org/bluez/hci1", false),
        ];
        assert!(pick_default(&adapters).is_none());
        assert!(pick_default(&[]).is_none());
    }
}
