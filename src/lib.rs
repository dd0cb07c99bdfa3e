//! Desktop applet backend for BlueZ.
//!
//! This crate mirrors the state a Bluetooth tray applet needs (adapters,
//! devices, killswitch, discoverability) and implements the `org.bluez.Agent1`
//! pairing agent protocol: incoming PIN, passkey, confirmation and
//! authorization prompts are forwarded to a UI as [`AgentEvent`]s, and the
//! UI's [`Reply`] is routed back to the suspended daemon call.
//!
//! The main entry point is [`Applet`].

mod adapter;
pub mod address;
mod agent;
mod applet;
pub mod device;
mod error;
mod registry;
mod watch;

pub use adapter::Adapter;
pub use agent::{AgentEvent, Reply};
pub use applet::{AgentEvents, Applet, KillswitchState, StateEvent, StateEvents};
pub use error::{Error, Result};

use zbus::{fdo::ObjectManagerProxy, Connection};

/// A cloneable handle to the system D-Bus connection.
///
/// This type is used to construct various objects in this library.
#[derive(Clone)]
pub struct Session {
    conn: Connection,
}

impl Session {
    /// Creates a new D-Bus connection.
    pub async fn new() -> Result<Self> {
        Ok(Self {
            conn: Connection::system().await.map_err(Error::from)?,
        })
    }

    /// Connects to the BlueZ D-Bus object manager.
    async fn object_manager(&self) -> Result<ObjectManagerProxy<'static>> {
        Ok(ObjectManagerProxy::builder(&self.conn)
            .destination("org.bluez")
            .map_err(Error::from)?
            .path("/")
            .map_err(Error::from)?
            .build()
            .await
            .map_err(Error::from)?)
    }
}
