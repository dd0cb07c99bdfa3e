//! The `org.bluez.Agent1` pairing agent.
//!
//! BlueZ drives pairing by calling back into a registered agent object
//! whenever a procedure needs user interaction. Each handler here resolves a
//! human-readable label for the device, parks the call in the
//! [`Registry`](crate::registry::Registry), forwards an [`AgentEvent`] to the
//! UI and then suspends until the UI's [`Reply`] (routed through
//! [`Applet::reply`](crate::Applet::reply)) resolves it. The daemon call
//! stays outstanding for the whole time; no thread is blocked.

use std::sync::Arc;

use futures_channel::{mpsc::UnboundedSender, oneshot};
use zbus::{
    dbus_interface, dbus_proxy,
    zvariant::{ObjectPath, OwnedObjectPath},
};

use crate::{
    device::Device,
    registry::{Outcome, PendingCall, Registry, Rejection},
    Error, Session,
};

/// Object path our agent is served at.
const AGENT_PATH: &str = "/org/bluetray/agent";

/// Advertised input/output capability: the UI can show figures and take both
/// text and yes/no input.
const AGENT_CAPABILITY: &str = "KeyboardDisplay";

const PAIRING_REJECTED: &str = "Pairing request rejected";
const CONFIRMATION_REJECTED: &str = "Confirmation request rejected";
const CALLBACK_CANCELLED: &str = "Agent callback cancelled";

/// A pairing prompt forwarded from the daemon to the UI.
///
/// The `token` identifies the request when answering via
/// [`Applet::reply`](crate::Applet::reply); `name` is a short display name
/// for the device and `label` a longer `'name' (address)` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// The user has to enter a PIN shown on (or expected by) the device.
    ///
    /// With `numeric` set the prompt asks for a numeric passkey and is
    /// answered with [`Reply::Pincode`]; otherwise it asks for a text PIN
    /// code and is answered with [`Reply::Passkey`].
    PincodeNeeded {
        token: String,
        name: String,
        label: String,
        numeric: bool,
    },
    /// The user has to confirm that `pin` matches what the device displays.
    /// Answered with [`Reply::Confirm`].
    ConfirmNeeded {
        token: String,
        name: String,
        label: String,
        pin: u32,
    },
    /// A device asks to use a service (or to pair, when `service_uuid` is
    /// `None`). Answered with [`Reply::Authorize`].
    AuthorizeNeeded {
        token: String,
        name: String,
        label: String,
        service_uuid: Option<String>,
    },
    /// The daemon withdrew all outstanding prompts; the UI should dismiss any
    /// open dialog.
    Cancelled,
}

/// The UI's decision on a pairing prompt.
///
/// `None` payloads and `false` booleans decline the request; the daemon then
/// sees an `org.bluez.Error.Rejected` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Numeric passkey for a [`AgentEvent::PincodeNeeded`] prompt with
    /// `numeric` set.
    Pincode(Option<u32>),
    /// Text PIN code for a [`AgentEvent::PincodeNeeded`] prompt with
    /// `numeric` unset.
    Passkey(Option<String>),
    Confirm(bool),
    /// Service authorization; with `remember` set the device is additionally
    /// marked as trusted so future connections skip the prompt.
    Authorize { accept: bool, remember: bool },
}

/// Errors returned to the daemon from agent method handlers.
#[derive(zbus::DBusError, Debug)]
#[dbus_error(prefix = "org.bluez.Error")]
pub(crate) enum AgentError {
    #[dbus_error(zbus_error)]
    ZBus(zbus::Error),
    Rejected(String),
}

/// Maps the outcome of an awaited [`PendingCall`] to the agent method's D-Bus
/// reply. A dropped sender counts as cancellation.
fn resolve<T>(
    outcome: Result<Outcome<T>, oneshot::Canceled>,
    declined: &str,
) -> Result<T, AgentError> {
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(Rejection::Declined)) => Err(AgentError::Rejected(declined.to_string())),
        Ok(Err(Rejection::Cancelled)) | Err(_) => {
            Err(AgentError::Rejected(CALLBACK_CANCELLED.to_string()))
        }
    }
}

/// Formats the `(name, label)` pair shown in pairing prompts.
fn format_label(address: &str, name: Option<&str>) -> (String, String) {
    match name {
        Some(name) => (name.to_string(), format!("'{}' ({})", name, address)),
        None => (address.to_string(), format!("'{}'", address)),
    }
}

/// The agent object served on the bus.
pub(crate) struct Agent {
    session: Session,
    registry: Arc<Registry>,
    events: UnboundedSender<AgentEvent>,
}

impl Agent {
    fn emit(&self, event: AgentEvent) {
        if self.events.unbounded_send(event).is_err() {
            log::debug!("dropping agent event, nobody is listening");
        }
    }

    /// Rejects everything outstanding and tells the UI to stand down.
    fn cancel_all(&self) {
        for call in self.registry.drain_all() {
            call.reject(Rejection::Cancelled);
        }
        self.emit(AgentEvent::Cancelled);
    }

    /// Resolves the name/label shown to the user for `path`.
    ///
    /// Best-effort: if the property fetch fails the object path itself is
    /// used, and the request proceeds regardless.
    async fn device_label(&self, path: &OwnedObjectPath) -> (String, String) {
        match self.fetch_name(path).await {
            Ok((address, name)) => format_label(&address, name.as_deref()),
            Err(e) => {
                log::warn!("failed to fetch properties of {}: {}", path, e);
                (path.to_string(), format!("'{}'", path))
            }
        }
    }

    async fn fetch_name(&self, path: &OwnedObjectPath) -> crate::Result<(String, Option<String>)> {
        let device = Device::new(self.session.clone(), path.clone().into_inner()).await?;
        let address = device.address().await?.to_string();
        // Devices that never sent a name fall back to address-only labels.
        let name = device.name().await.ok();
        Ok((address, name))
    }
}

#[dbus_interface(name = "org.bluez.Agent1")]
impl Agent {
    async fn release(&self) {
        log::debug!("agent released by the daemon");
        self.cancel_all();
    }

    async fn request_pin_code(&self, device: OwnedObjectPath) -> Result<String, AgentError> {
        log::debug!("PIN code requested for {}", device);
        let (name, label) = self.device_label(&device).await;
        let (tx, rx) = oneshot::channel();
        self.registry
            .register(device.as_str(), PendingCall::Passkey(tx));
        self.emit(AgentEvent::PincodeNeeded {
            token: device.to_string(),
            name,
            label,
            numeric: false,
        });
        resolve(rx.await, PAIRING_REJECTED)
    }

    async fn request_passkey(&self, device: OwnedObjectPath) -> Result<u32, AgentError> {
        log::debug!("passkey requested for {}", device);
        let (name, label) = self.device_label(&device).await;
        let (tx, rx) = oneshot::channel();
        self.registry
            .register(device.as_str(), PendingCall::Pincode(tx));
        self.emit(AgentEvent::PincodeNeeded {
            token: device.to_string(),
            name,
            label,
            numeric: true,
        });
        resolve(rx.await, PAIRING_REJECTED)
    }

    async fn request_confirmation(
        &self,
        device: OwnedObjectPath,
        passkey: u32,
    ) -> Result<(), AgentError> {
        log::debug!("confirmation of {:06} requested for {}", passkey, device);
        let (name, label) = self.device_label(&device).await;
        let (tx, rx) = oneshot::channel();
        self.registry
            .register(device.as_str(), PendingCall::Confirm(tx));
        self.emit(AgentEvent::ConfirmNeeded {
            token: device.to_string(),
            name,
            label,
            pin: passkey,
        });
        resolve(rx.await, CONFIRMATION_REJECTED)
    }

    async fn request_authorization(&self, device: OwnedObjectPath) -> Result<(), AgentError> {
        log::debug!("pairing authorization requested for {}", device);
        let (name, label) = self.device_label(&device).await;
        let (tx, rx) = oneshot::channel();
        self.registry
            .register(device.as_str(), PendingCall::Authorize(tx));
        self.emit(AgentEvent::AuthorizeNeeded {
            token: device.to_string(),
            name,
            label,
            service_uuid: None,
        });
        resolve(rx.await, CONFIRMATION_REJECTED)
    }

    async fn authorize_service(
        &self,
        device: OwnedObjectPath,
        uuid: String,
    ) -> Result<(), AgentError> {
        log::debug!("authorization of service {} requested for {}", uuid, device);
        let (name, label) = self.device_label(&device).await;
        let (tx, rx) = oneshot::channel();
        self.registry
            .register(device.as_str(), PendingCall::Authorize(tx));
        self.emit(AgentEvent::AuthorizeNeeded {
            token: device.to_string(),
            name,
            label,
            service_uuid: Some(uuid),
        });
        resolve(rx.await, CONFIRMATION_REJECTED)
    }

    async fn cancel(&self) {
        log::debug!("daemon cancelled all outstanding agent requests");
        self.cancel_all();
    }
}

#[dbus_proxy(
    interface = "org.bluez.AgentManager1",
    default_service = "org.bluez",
    default_path = "/org/bluez",
    assume_defaults = false
)]
trait AgentManager {
    async fn register_agent(&self, agent: &ObjectPath<'_>, capability: &str) -> zbus::Result<()>;
    async fn request_default_agent(&self, agent: &ObjectPath<'_>) -> zbus::Result<()>;
    async fn unregister_agent(&self, agent: &ObjectPath<'_>) -> zbus::Result<()>;
}

fn agent_object_path() -> ObjectPath<'static> {
    ObjectPath::from_static_str_unchecked(AGENT_PATH)
}

/// A live agent registration, torn down and recreated whenever the default
/// adapter changes.
pub(crate) struct AgentBinding {
    session: Session,
    manager: AgentManagerProxy<'static>,
    adapter: OwnedObjectPath,
}

impl AgentBinding {
    /// Serves an [`Agent`] on the connection and registers it with the
    /// daemon's agent manager.
    pub(crate) async fn register(
        session: &Session,
        registry: Arc<Registry>,
        events: UnboundedSender<AgentEvent>,
        adapter: &OwnedObjectPath,
    ) -> crate::Result<Self> {
        let agent = Agent {
            session: session.clone(),
            registry,
            events,
        };
        let path = agent_object_path();
        let added = session
            .conn
            .object_server()
            .at(path.clone(), agent)
            .await
            .map_err(Error::from)?;
        if !added {
            log::warn!("an agent object was already being served at {}", AGENT_PATH);
        }

        let manager = AgentManagerProxy::new(&session.conn)
            .await
            .map_err(Error::from)?;
        if let Err(e) = manager.register_agent(&path, AGENT_CAPABILITY).await {
            let _ = session
                .conn
                .object_server()
                .remove::<Agent, _>(path.clone())
                .await;
            return Err(Error::from(e));
        }
        // Also handle requests initiated by remote devices, not just local
        // pairing attempts.
        if let Err(e) = manager.request_default_agent(&path).await {
            log::warn!("failed to become the default agent: {}", e);
        }

        log::debug!("pairing agent registered (serving adapter {})", adapter);
        Ok(Self {
            session: session.clone(),
            manager,
            adapter: adapter.clone(),
        })
    }

    /// Unregisters the agent and rejects whatever was still pending under it.
    pub(crate) async fn unregister(self, registry: &Registry) {
        log::debug!("tearing down pairing agent for adapter {}", self.adapter);
        let path = agent_object_path();
        if let Err(e) = self.manager.unregister_agent(&path).await {
            log::warn!("failed to unregister agent: {}", e);
        }

        let stale = registry.drain_all();
        if !stale.is_empty() {
            log::debug!(
                "rejecting {} request(s) left pending by the previous adapter",
                stale.len()
            );
        }
        for call in stale {
            call.reject(Rejection::Cancelled);
        }

        if let Err(e) = self
            .session
            .conn
            .object_server()
            .remove::<Agent, _>(path)
            .await
        {
            log::warn!("failed to remove agent object: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_with_and_without_name() {
        let (name, label) = format_label("AA:BB:CC:11:22:33", Some("Keyboard"));
        assert_eq!(name, "Keyboard");
        assert_eq!(label, "'Keyboard' (AA:BB:CC:11:22:33)");

        let (name, label) = format_label("AA:BB:CC:11:22:33", None);
        assert_eq!(name, "AA:BB:CC:11:22:33");
        assert_eq!(label, "'AA:BB:CC:11:22:33'");
    }

    #[test]
    fn resolve_maps_outcomes_to_replies() {
        assert!(matches!(resolve(Ok(Ok(42u32)), PAIRING_REJECTED), Ok(42)));

        match resolve::<u32>(Ok(Err(Rejection::Declined)), PAIRING_REJECTED) {
            Err(AgentError::Rejected(msg)) => assert_eq!(msg, PAIRING_REJECTED),
            other => panic!("unexpected result {:?}", other),
        }

        match resolve::<u32>(Ok(Err(Rejection::Cancelled)), PAIRING_REJECTED) {
            Err(AgentError::Rejected(msg)) => assert_eq!(msg, CALLBACK_CANCELLED),
            other => panic!("unexpected result {:?}", other),
        }

        // A dropped sender behaves like an explicit cancellation.
        match resolve::<u32>(Err(oneshot::Canceled), PAIRING_REJECTED) {
            Err(AgentError::Rejected(msg)) => assert_eq!(msg, CALLBACK_CANCELLED),
            other => panic!("unexpected result {:?}", other),
        }
    }
}
