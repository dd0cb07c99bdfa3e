//! Table of outstanding pairing agent requests.
//!
//! Every inbound agent call suspends inside its method handler until the UI
//! answers. The suspended call is represented by a [`PendingCall`], a
//! single-use completion handle keyed by the device's object path. Completing
//! a call consumes the handle; a handle that is dropped without being
//! completed resolves the suspended call as cancelled, so a daemon call can
//! never be left dangling or answered twice.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use futures_channel::oneshot;

use crate::agent::Reply;

/// Why a pending call was not answered with a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejection {
    /// The user declined the request.
    Declined,
    /// The request was withdrawn (daemon cancel, agent teardown).
    Cancelled,
}

pub(crate) type Outcome<T> = std::result::Result<T, Rejection>;

/// A suspended agent call awaiting exactly one answer.
///
/// The variant names the answer the call is waiting for: `Pincode` calls are
/// answered with a numeric PIN, `Passkey` calls with a text passkey, matching
/// the [`Reply`] vocabulary.
#[derive(Debug)]
pub(crate) enum PendingCall {
    Pincode(oneshot::Sender<Outcome<u32>>),
    Passkey(oneshot::Sender<Outcome<String>>),
    Confirm(oneshot::Sender<Outcome<()>>),
    Authorize(oneshot::Sender<Outcome<()>>),
}

impl PendingCall {
    fn kind(&self) -> &'static str {
        match self {
            Self::Pincode(_) => "pincode",
            Self::Passkey(_) => "passkey",
            Self::Confirm(_) => "confirmation",
            Self::Authorize(_) => "authorization",
        }
    }

    /// Resolves the call without an answer value.
    pub(crate) fn reject(self, why: Rejection) {
        match self {
            Self::Pincode(tx) => drop(tx.send(Err(why))),
            Self::Passkey(tx) => drop(tx.send(Err(why))),
            Self::Confirm(tx) => drop(tx.send(Err(why))),
            Self::Authorize(tx) => drop(tx.send(Err(why))),
        }
    }

    /// Resolves the call with the UI's decision.
    ///
    /// A reply whose kind does not match the pending call rejects the call;
    /// the daemon's per-device request contract makes this unreachable unless
    /// the UI answers with a stale token.
    pub(crate) fn complete(self, reply: Reply) {
        match (self, reply) {
            (Self::Pincode(tx), Reply::Pincode(Some(pin))) => drop(tx.send(Ok(pin))),
            (Self::Pincode(tx), Reply::Pincode(None)) => drop(tx.send(Err(Rejection::Declined))),
            (Self::Passkey(tx), Reply::Passkey(Some(key))) => drop(tx.send(Ok(key))),
            (Self::Passkey(tx), Reply::Passkey(None)) => drop(tx.send(Err(Rejection::Declined))),
            (Self::Confirm(tx), Reply::Confirm(true)) => drop(tx.send(Ok(()))),
            (Self::Confirm(tx), Reply::Confirm(false)) => drop(tx.send(Err(Rejection::Declined))),
            (Self::Authorize(tx), Reply::Authorize { accept: true, .. }) => drop(tx.send(Ok(()))),
            (Self::Authorize(tx), Reply::Authorize { accept: false, .. }) => {
                drop(tx.send(Err(Rejection::Declined)))
            }
            (call, reply) => {
                log::warn!(
                    "reply {:?} does not answer the pending {} request, rejecting",
                    reply,
                    call.kind()
                );
                call.reject(Rejection::Declined);
            }
        }
    }
}

/// The set of outstanding agent requests, keyed by device object path.
///
/// BlueZ keeps at most one agent request outstanding per device, so the path
/// uniquely identifies a request for as long as it is unanswered.
pub(crate) struct Registry {
    calls: Mutex<HashMap<String, PendingCall>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, PendingCall>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Records a call as outstanding under `token`.
    ///
    /// A duplicate token is logged and the previous entry displaced; dropping
    /// the displaced handle resolves its daemon call as cancelled, so the
    /// stale call still completes exactly once.
    pub(crate) fn register(&self, token: &str, call: PendingCall) {
        if let Some(stale) = self.table().insert(token.to_string(), call) {
            log::warn!(
                "displacing pending {} request for {} (daemon re-requested before a reply)",
                stale.kind(),
                token
            );
        }
    }

    /// Removes and returns the call registered under `token`, if any.
    ///
    /// Absent tokens are not an error: the request may have been answered or
    /// cancelled already.
    pub(crate) fn take(&self, token: &str) -> Option<PendingCall> {
        self.table().remove(token)
    }

    /// Removes and returns every outstanding call.
    pub(crate) fn drain_all(&self) -> Vec<PendingCall> {
        self.table().drain().map(|(_, call)| call).collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table().len()
    }
}

#[cfg(test)]
mod tests {
    use pollster::block_on;

    use super::*;

    #[test]
    fn register_take_roundtrip() {
        let registry = Registry::new();
        let (tx, rx) = oneshot::channel();
        registry.register("/dev/1", PendingCall::Pincode(tx));

        let call = registry.take("/dev/1").unwrap();
        assert!(registry.take("/dev/1").is_none());

        match call {
            PendingCall::Pincode(tx) => tx.send(Ok(1234)).unwrap(),
            other => panic!("unexpected call {:?}", other),
        }
        assert_eq!(block_on(rx).unwrap(), Ok(1234));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn drain_empties_the_table() {
        let registry = Registry::new();
        let (tx1, rx1) = oneshot::channel::<Outcome<()>>();
        let (tx2, rx2) = oneshot::channel::<Outcome<()>>();
        registry.register("/dev/1", PendingCall::Confirm(tx1));
        registry.register("/dev/2", PendingCall::Authorize(tx2));

        let drained = registry.drain_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.len(), 0);
        assert!(registry.drain_all().is_empty());

        for call in drained {
            call.reject(Rejection::Cancelled);
        }
        assert_eq!(block_on(rx1).unwrap(), Err(Rejection::Cancelled));
        assert_eq!(block_on(rx2).unwrap(), Err(Rejection::Cancelled));
    }

    #[test]
    fn duplicate_token_displaces_and_cancels() {
        let registry = Registry::new();
        let (tx1, rx1) = oneshot::channel::<Outcome<u32>>();
        let (tx2, rx2) = oneshot::channel::<Outcome<u32>>();
        registry.register("/dev/1", PendingCall::Pincode(tx1));
        registry.register("/dev/1", PendingCall::Pincode(tx2));
        assert_eq!(registry.len(), 1);

        // The displaced sender is gone; its receiver resolves as cancelled.
        assert!(block_on(rx1).is_err());

        registry.take("/dev/1").unwrap().complete(Reply::Pincode(Some(42)));
        assert_eq!(block_on(rx2).unwrap(), Ok(42));
    }

    #[test]
    fn accepting_replies_carry_payloads() {
        let (tx, rx) = oneshot::channel();
        PendingCall::Passkey(tx).complete(Reply::Passkey(Some("0000".to_string())));
        assert_eq!(block_on(rx).unwrap(), Ok("0000".to_string()));

        let (tx, rx) = oneshot::channel();
        PendingCall::Confirm(tx).complete(Reply::Confirm(true));
        assert_eq!(block_on(rx).unwrap(), Ok(()));

        let (tx, rx) = oneshot::channel();
        PendingCall::Authorize(tx).complete(Reply::Authorize {
            accept: true,
            remember: false,
        });
        assert_eq!(block_on(rx).unwrap(), Ok(()));
    }

    #[test]
    fn declining_replies_reject() {
        let (tx, rx) = oneshot::channel::<Outcome<u32>>();
        PendingCall::Pincode(tx).complete(Reply::Pincode(None));
        assert_eq!(block_on(rx).unwrap(), Err(Rejection::Declined));

        let (tx, rx) = oneshot::channel::<Outcome<()>>();
        PendingCall::Confirm(tx).complete(Reply::Confirm(false));
        assert_eq!(block_on(rx).unwrap(), Err(Rejection::Declined));

        let (tx, rx) = oneshot::channel::<Outcome<()>>();
        PendingCall::Authorize(tx).complete(Reply::Authorize {
            accept: false,
            remember: true,
        });
        assert_eq!(block_on(rx).unwrap(), Err(Rejection::Declined));
    }

    #[test]
    fn mismatched_reply_kind_rejects() {
        let (tx, rx) = oneshot::channel::<Outcome<u32>>();
        PendingCall::Pincode(tx).complete(Reply::Confirm(true));
        assert_eq!(block_on(rx).unwrap(), Err(Rejection::Declined));
    }

    #[test]
    fn dropping_a_call_cancels_it() {
        let (tx, rx) = oneshot::channel::<Outcome<()>>();
        drop(PendingCall::Confirm(tx));
        assert!(block_on(rx).is_err());
    }
}
