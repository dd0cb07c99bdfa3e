//! The applet backend facade.

use std::{
    future::ready,
    pin::{pin, Pin},
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll},
};

use futures_channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures_util::{
    stream::{select, FuturesUnordered},
    Stream, StreamExt,
};
use zbus::{
    fdo::{InterfacesAdded, InterfacesRemoved},
    zvariant::{ObjectPath, OwnedObjectPath},
};

use crate::{
    adapter::{pick_default, Adapter, AdapterSnapshot, ADAPTER_PROPERTIES},
    agent::{AgentBinding, AgentEvent, Reply},
    device::{Device, DeviceInfo, DEVICE_PROPERTIES},
    registry::{PendingCall, Registry},
    watch::PropertyWatch,
    Error, Result, Session,
};

/// Whether Bluetooth hardware is present and its radios are on.
///
/// Derived from the adapters BlueZ exposes; a hardware rfkill switch shows up
/// here indirectly, as adapters losing power or disappearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillswitchState {
    /// No adapter is present.
    NoAdapter,
    /// Adapters are present but not all of them are powered.
    SoftBlocked,
    /// Every adapter is powered.
    Unblocked,
}

impl KillswitchState {
    fn derive(present: usize, powered: usize) -> Self {
        if present == 0 {
            Self::NoAdapter
        } else if powered == present {
            Self::Unblocked
        } else {
            Self::SoftBlocked
        }
    }
}

/// A change to the observable applet state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// The device list changed in some way; re-query [`Applet::devices`].
    DevicesChanged,
    KillswitchChanged(KillswitchState),
    DiscoverableChanged(bool),
}

/// Stream of [`AgentEvent`]s, in arrival order. Returned by [`Applet::new`].
pub struct AgentEvents(UnboundedReceiver<AgentEvent>);

impl Stream for AgentEvents {
    type Item = AgentEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<AgentEvent>> {
        Pin::new(&mut self.0).poll_next(cx)
    }
}

/// Stream of [`StateEvent`]s. Returned by [`Applet::new`].
pub struct StateEvents(UnboundedReceiver<StateEvent>);

impl Stream for StateEvents {
    type Item = StateEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StateEvent>> {
        Pin::new(&mut self.0).poll_next(cx)
    }
}

#[derive(Default)]
struct Inner {
    present: usize,
    powered: usize,
    discoverable: bool,
    adapters: Vec<OwnedObjectPath>,
    devices: Vec<OwnedObjectPath>,
    default_adapter: Option<OwnedObjectPath>,
    binding: Option<AgentBinding>,
}

/// The Bluetooth applet backend.
///
/// Construction powers all adapters up, takes a first snapshot of the bus and
/// registers the pairing agent. Afterwards, [`Applet::run`] must be driven to
/// keep the mirrored state fresh and the agent bound to the current default
/// adapter; the UI consumes the two event streams and answers pairing prompts
/// through [`Applet::reply`].
pub struct Applet {
    session: Session,
    registry: Arc<Registry>,
    agent_tx: UnboundedSender<AgentEvent>,
    state_tx: UnboundedSender<StateEvent>,
    inner: Mutex<Inner>,
}

impl Applet {
    /// Creates the applet backend on the given [`Session`].
    pub async fn new(session: &Session) -> Result<(Self, AgentEvents, StateEvents)> {
        let (agent_tx, agent_rx) = mpsc::unbounded();
        let (state_tx, state_rx) = mpsc::unbounded();
        let applet = Self {
            session: session.clone(),
            registry: Arc::new(Registry::new()),
            agent_tx,
            state_tx,
            inner: Mutex::new(Inner::default()),
        };

        // Power up all adapters, so that unblocked radios are usable right
        // away instead of showing up as present-but-dead.
        applet.power_all(true).await?;
        applet.refresh().await?;

        Ok((applet, AgentEvents(agent_rx), StateEvents(state_rx)))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: StateEvent) {
        if self.state_tx.unbounded_send(event).is_err() {
            log::debug!("dropping state event, nobody is listening");
        }
    }

    /// Answers the pairing prompt identified by `token`.
    ///
    /// Unknown tokens are ignored: the request may have been cancelled by the
    /// daemon, or answered already. Accepting an authorization with
    /// `remember` set marks the device as trusted first; failure to do so is
    /// logged and does not keep the authorization from completing.
    pub async fn reply(&self, token: &str, reply: Reply) {
        let Some(call) = self.registry.take(token) else {
            log::debug!(
                "no pending agent request for {} (already answered or cancelled)",
                token
            );
            return;
        };

        if let (
            PendingCall::Authorize(_),
            Reply::Authorize {
                accept: true,
                remember: true,
            },
        ) = (&call, &reply)
        {
            if let Err(e) = self.mark_trusted(token).await {
                log::warn!("failed to mark {} as trusted: {}", token, e);
            }
        }

        call.complete(reply);
    }

    async fn mark_trusted(&self, token: &str) -> Result<()> {
        self.device_at(token).await?.set_trusted(true).await
    }

    async fn device_at(&self, path: &str) -> Result<Device> {
        let path = ObjectPath::try_from(path.to_string())
            .map_err(|e| Error::from(format!("invalid device path '{}': {}", path, e)))?;
        Device::new(self.session.clone(), path).await
    }

    /// Returns the current killswitch state.
    pub fn killswitch_state(&self) -> KillswitchState {
        let inner = self.lock();
        KillswitchState::derive(inner.present, inner.powered)
    }

    /// Powers the radios on ([`Unblocked`]) or off ([`SoftBlocked`]).
    ///
    /// Returns `false` if there was no adapter to switch.
    ///
    /// [`Unblocked`]: KillswitchState::Unblocked
    /// [`SoftBlocked`]: KillswitchState::SoftBlocked
    pub async fn set_killswitch_state(&self, state: KillswitchState) -> Result<bool> {
        match state {
            KillswitchState::Unblocked => self.power_all(true).await,
            KillswitchState::SoftBlocked => self.power_all(false).await,
            KillswitchState::NoAdapter => {
                log::warn!("cannot switch the killswitch to {:?}", state);
                Ok(false)
            }
        }
    }

    async fn power_all(&self, powered: bool) -> Result<bool> {
        let mut any = false;
        for adapter in Adapter::enumerate(&self.session).await? {
            any = true;
            if let Err(e) = adapter.set_powered(powered).await {
                log::warn!(
                    "failed to power {} {}: {}",
                    adapter.device_name(),
                    if powered { "on" } else { "off" },
                    e
                );
            }
        }
        Ok(any)
    }

    /// Returns whether the default adapter is visible to other devices.
    pub fn is_discoverable(&self) -> bool {
        self.lock().discoverable
    }

    /// Makes the default adapter visible (or invisible) to other devices.
    pub async fn set_discoverable(&self, discoverable: bool) -> Result<()> {
        match self.default_adapter() {
            Some(path) => {
                Adapter::at(&self.session, &path)
                    .await?
                    .set_discoverable(discoverable)
                    .await
            }
            None => Err(Error::from("no default adapter")),
        }
    }

    /// Returns whether the UI should offer the full menu (device submenus and
    /// global actions), which is only useful with all radios up.
    pub fn show_full_menu(&self) -> bool {
        let inner = self.lock();
        inner.present > 0 && inner.powered == inner.present
    }

    fn default_adapter(&self) -> Option<OwnedObjectPath> {
        self.lock().default_adapter.clone()
    }

    /// Returns a snapshot of the devices known to the default adapter.
    pub async fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let Some(default) = self.default_adapter() else {
            return Ok(Vec::new());
        };

        let manager = self.session.object_manager().await?;
        let objects = manager.get_managed_objects().await.map_err(Error::from)?;
        let mut devices = objects
            .iter()
            .filter_map(|(path, intfs)| {
                if !belongs_to(path, &default) {
                    return None;
                }
                DeviceInfo::from_props(path, intfs.get("org.bluez.Device1")?)
            })
            .collect::<Vec<_>>();
        devices.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(devices)
    }

    /// Connects to the device at `path`.
    pub async fn connect_device(&self, path: &str) -> Result<()> {
        self.device_at(path).await?.connect().await
    }

    /// Disconnects the device at `path`.
    pub async fn disconnect_device(&self, path: &str) -> Result<()> {
        self.device_at(path).await?.disconnect().await
    }

    /// Re-reads the bus state, rebinds the agent if the default adapter
    /// changed, and notifies the state event stream.
    async fn refresh(&self) -> Result<()> {
        let manager = self.session.object_manager().await?;
        let objects = manager.get_managed_objects().await.map_err(Error::from)?;

        let mut adapters = Vec::new();
        let mut devices = Vec::new();
        for (path, intfs) in &objects {
            if let Some(props) = intfs.get("org.bluez.Adapter1") {
                adapters.push(AdapterSnapshot::from_props(path.clone(), props));
            }
            if intfs.contains_key("org.bluez.Device1") {
                devices.push(path.clone());
            }
        }

        let present = adapters.len();
        let powered = adapters.iter().filter(|a| a.powered).count();
        let default = pick_default(&adapters).cloned();
        let discoverable = default.as_ref().map(|a| a.discoverable).unwrap_or(false);
        let default_path = default.map(|a| a.path);

        let (old_binding, default_changed, prev_killswitch, prev_discoverable) = {
            let mut inner = self.lock();
            let prev_killswitch = KillswitchState::derive(inner.present, inner.powered);
            let prev_discoverable = inner.discoverable;
            let default_changed = inner.default_adapter != default_path;
            let old_binding = if default_changed {
                inner.binding.take()
            } else {
                None
            };
            inner.present = present;
            inner.powered = powered;
            inner.discoverable = discoverable;
            inner.adapters = adapters.into_iter().map(|a| a.path).collect();
            inner.devices = devices;
            inner.default_adapter = default_path.clone();
            (old_binding, default_changed, prev_killswitch, prev_discoverable)
        };

        if default_changed {
            if let Some(binding) = old_binding {
                binding.unregister(&self.registry).await;
            }
            if let Some(path) = &default_path {
                let registration = AgentBinding::register(
                    &self.session,
                    Arc::clone(&self.registry),
                    self.agent_tx.clone(),
                    path,
                )
                .await;
                match registration {
                    Ok(binding) => self.lock().binding = Some(binding),
                    Err(e) => log::error!("failed to register pairing agent for {}: {}", path, e),
                }
            }
        }

        let killswitch = KillswitchState::derive(present, powered);
        if killswitch != prev_killswitch {
            self.emit(StateEvent::KillswitchChanged(killswitch));
        }
        if discoverable != prev_discoverable {
            self.emit(StateEvent::DiscoverableChanged(discoverable));
        }
        self.emit(StateEvent::DevicesChanged);

        Ok(())
    }

    /// Keeps the mirrored state fresh.
    ///
    /// Watches BlueZ for adapters and devices appearing, disappearing or
    /// changing relevant properties, and refreshes on every such change. Runs
    /// until the D-Bus connection fails.
    pub async fn run(&self) -> Result<()> {
        let manager = self.session.object_manager().await?;
        let mut signals = manager.receive_all_signals().await.map_err(Error::from)?;

        loop {
            let (adapters, devices) = {
                let inner = self.lock();
                (inner.adapters.clone(), inner.devices.clone())
            };

            let mut watches = Vec::new();
            for path in &adapters {
                match PropertyWatch::subscribe(&self.session, path, ADAPTER_PROPERTIES).await {
                    Ok(watch) => watches.push(watch),
                    Err(e) => log::warn!("cannot watch properties of {}: {}", path, e),
                }
            }
            for path in &devices {
                match PropertyWatch::subscribe(&self.session, path, DEVICE_PROPERTIES).await {
                    Ok(watch) => watches.push(watch),
                    Err(e) => log::warn!("cannot watch properties of {}: {}", path, e),
                }
            }

            let added_removed = signals.by_ref().filter_map(|message| async move {
                if let Some(added) = InterfacesAdded::from_message(message.clone()) {
                    let args = added.args().ok()?;
                    (args
                        .interfaces_and_properties
                        .contains_key("org.bluez.Adapter1")
                        || args
                            .interfaces_and_properties
                            .contains_key("org.bluez.Device1"))
                    .then_some(())
                } else if let Some(removed) = InterfacesRemoved::from_message(message) {
                    let args = removed.args().ok()?;
                    (args.interfaces.contains(&"org.bluez.Adapter1")
                        || args.interfaces.contains(&"org.bluez.Device1"))
                    .then_some(())
                } else {
                    None
                }
            });

            let property_ticks: FuturesUnordered<_> =
                watches.iter_mut().map(|watch| watch.wait()).collect();

            {
                let mut changes = pin!(select(
                    added_removed,
                    property_ticks.filter_map(|res| ready(res.ok()))
                ));
                if changes.next().await.is_none() {
                    return Err(Error::from("BlueZ signal stream ended"));
                }
            }

            self.refresh().await?;
        }
    }
}

/// Returns whether `path` is an object below the `adapter` path.
fn belongs_to(path: &OwnedObjectPath, adapter: &OwnedObjectPath) -> bool {
    path.as_str()
        .strip_prefix(adapter.as_str())
        .map_or(false, |rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn killswitch_derivation() {
        assert_eq!(KillswitchState::derive(0, 0), KillswitchState::NoAdapter);
        assert_eq!(KillswitchState::derive(1, 0), KillswitchState::SoftBlocked);
        assert_eq!(KillswitchState::derive(2, 1), KillswitchState::SoftBlocked);
        assert_eq!(KillswitchState::derive(1, 1), KillswitchState::Unblocked);
        assert_eq!(KillswitchState::derive(2, 2), KillswitchState::Unblocked);
    }

    #[test]
    fn device_paths_belong_to_their_adapter() {
        let adapter = OwnedObjectPath::from(ObjectPath::try_from("/org/bluez/hci1").unwrap());
        let dev = |s: &str| OwnedObjectPath::from(ObjectPath::try_from(s).unwrap());

        assert!(belongs_to(&dev("/org/bluez/hci1/dev_AA"), &adapter));
        assert!(!belongs_to(&dev("/org/bluez/hci1"), &adapter));
        assert!(!belongs_to(&dev("/org/bluez/hci10/dev_AA"), &adapter));
        assert!(!belongs_to(&dev("/org/bluez/hci0/dev_AA"), &adapter));
    }
}
