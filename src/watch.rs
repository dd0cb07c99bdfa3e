//! Property change subscriptions.

use futures_util::StreamExt;
use zbus::{
    fdo::{PropertiesChangedStream, PropertiesProxy},
    zvariant::ObjectPath,
};

use crate::{Error, Result, Session};

/// Watches the `PropertiesChanged` signal of a single BlueZ object, filtered
/// to a fixed set of interesting property names.
pub(crate) struct PropertyWatch {
    stream: PropertiesChangedStream<'static>,
    interest: &'static [&'static str],
}

impl PropertyWatch {
    /// Subscribes to property changes of the object at `path`.
    pub(crate) async fn subscribe(
        session: &Session,
        path: &ObjectPath<'_>,
        interest: &'static [&'static str],
    ) -> Result<Self> {
        // Property changes are signaled via the `PropertiesChanged` signal on
        // the `org.freedesktop.DBus.Properties` interface.
        let proxy = PropertiesProxy::builder(&session.conn)
            .path(path.to_owned())
            .map_err(Error::from)?
            .destination("org.bluez")
            .map_err(Error::from)?
            .build()
            .await
            .map_err(Error::from)?;
        let stream = proxy
            .receive_properties_changed()
            .await
            .map_err(Error::from)?;
        Ok(Self { stream, interest })
    }

    /// Asynchronously waits until one of the watched properties changes.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying signal stream ends, which usually
    /// means the object disappeared from the bus.
    pub(crate) async fn wait(&mut self) -> Result<()> {
        loop {
            match self.stream.next().await {
                Some(changed) => {
                    let args = changed.args().map_err(Error::from)?;

                    log::trace!(
                        "{:?}: changed {:?}",
                        changed.path(),
                        args.changed_properties.keys(),
                    );

                    let interesting = args
                        .changed_properties
                        .keys()
                        .copied()
                        .chain(args.invalidated_properties.iter().copied())
                        .any(|prop| self.interest.iter().any(|i| *i == prop));
                    if interesting {
                        return Ok(());
                    }
                }
                None => return Err(Error::from("property change stream ended")),
            }
        }
    }
}
