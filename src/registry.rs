//! Proxy bindings: which object answers on which endpoint.
//!
//! A [`Registry`] allows at most one live binding per endpoint. Binding installs
//! a listener (a local task) on the endpoint; [`ProxyHandle::dispose`] removes
//! the binding and stops the listener, after which the endpoint can be bound
//! again. Messages still queued for a disposed binding, or sent before the next
//! `bind`, are dropped rather than answered by a different object.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use futures::FutureExt as _;
use futures::channel::oneshot;
use tracing::Instrument as _;
use uuid::Uuid;

use crate::bridge::{CallbackBridge, PersistedRefs};
use crate::endpoint::{Endpoint, EndpointId, Inbox, Outbox};
use crate::error::{ErrorDescriptor, ProxyError};
use crate::executor;
use crate::message::{Classified, Inbound, Operation, Outbound, RequestId};
use crate::value::{RemoteObject, Value};

/// Tracks the live bindings. Clones share the same table.
#[derive(Clone, Default)]
pub struct Registry {
    bindings: Rc<RefCell<HashMap<EndpointId, BindingEntry>>>,
}

struct BindingEntry {
    binding: Uuid,
    inbox: Inbox,

    /// Dropping this stops the listener.
    _stop_tx: oneshot::Sender<()>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose `object` on `endpoint`.
    ///
    /// Fails with [`ProxyError::DuplicateBinding`] if the endpoint is already
    /// bound. Must be called from within a [`tokio::task::LocalSet`].
    pub fn bind(
        &self,
        object: Rc<dyn RemoteObject>,
        endpoint: &Endpoint,
    ) -> Result<ProxyHandle, ProxyError> {
        let endpoint_id = endpoint.id();
        let mut bindings = self.bindings.borrow_mut();
        if bindings.contains_key(&endpoint_id) {
            return Err(ProxyError::DuplicateBinding {
                endpoint: endpoint_id,
            });
        }

        let binding = Uuid::new_v4();
        let inbox = endpoint.inbox();
        inbox.adopt();
        let (stop_tx, stop_rx) = oneshot::channel();
        bindings.insert(
            endpoint_id,
            BindingEntry {
                binding,
                inbox: inbox.clone(),
                _stop_tx: stop_tx,
            },
        );

        let listener = Listener {
            root: Value::Object(object),
            outbox: endpoint.outbox(),
            persisted: PersistedRefs::default(),
        };
        tokio::task::spawn_local(
            listener
                .run(inbox, stop_rx)
                .instrument(tracing::info_span!("binding", endpoint = %endpoint_id)),
        );

        tracing::info!(endpoint = %endpoint_id, "proxy bound");
        Ok(ProxyHandle {
            registry: self.clone(),
            endpoint: endpoint_id,
            binding,
        })
    }

    pub fn is_bound(&self, endpoint: EndpointId) -> bool {
        self.bindings.borrow().contains_key(&endpoint)
    }

    pub fn len(&self) -> usize {
        self.bindings.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.borrow().is_empty()
    }
}

/// Returned by [`Registry::bind`]. Dropping the handle does not unbind; call
/// [`ProxyHandle::dispose`].
#[must_use]
pub struct ProxyHandle {
    registry: Registry,
    endpoint: EndpointId,
    binding: Uuid,
}

impl std::fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("endpoint", &self.endpoint)
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

impl ProxyHandle {
    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    /// Remove the binding and stop listening. Messages not yet picked up are
    /// dropped; work already in flight still completes and reports. Calling this
    /// again, or after the endpoint was re-bound by someone else, does nothing.
    pub fn dispose(&self) {
        let mut bindings = self.registry.bindings.borrow_mut();
        let ours = bindings
            .get(&self.endpoint)
            .is_some_and(|entry| entry.binding == self.binding);
        if !ours {
            return;
        }
        if let Some(entry) = bindings.remove(&self.endpoint) {
            entry.inbox.retire();
            tracing::info!(endpoint = %self.endpoint, "proxy disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        !self
            .registry
            .bindings
            .borrow()
            .get(&self.endpoint)
            .is_some_and(|entry| entry.binding == self.binding)
    }
}

/// Per-binding state, owned by the listener task.
struct Listener {
    root: Value,
    outbox: Outbox,
    persisted: PersistedRefs,
}

impl Listener {
    async fn run(self, inbox: Inbox, mut stop_rx: oneshot::Receiver<()>) {
        loop {
            let message = futures::select_biased! {
                _ = stop_rx => break,
                message = inbox.next().fuse() => message,
            };
            match message {
                Some(message) => self.handle_message(message),
                None => {
                    tracing::debug!("inbound side closed");
                    break;
                }
            }
        }
        tracing::debug!("listener stopped");
    }

    /// Never fails: every problem becomes an `ERROR` envelope or a log line.
    fn handle_message(&self, message: serde_json::Value) {
        tracing::trace!(?message, "received message");
        match Inbound::classify(message) {
            Classified::Message(Inbound::Operation { id, data }) => self.handle_operation(id, data),
            Classified::Message(Inbound::Dispose { reference }) => {
                let known = self.persisted.remove(&reference);
                tracing::debug!(%reference, known, "dispose");
            }
            Classified::Ignored => tracing::debug!("ignoring message not addressed to the proxy"),
            Classified::Malformed { id: Some(id), error } => {
                respond(&self.outbox, id, Err(&anyhow::Error::from(error)));
            }
            Classified::Malformed { id: None, error } => {
                tracing::warn!(%error, "dropping malformed message without an id");
            }
        }
    }

    fn handle_operation(&self, id: RequestId, operations: Vec<Operation>) {
        let span = tracing::info_span!("operation", %id, steps = operations.len());
        let _enter = span.enter();

        let bridge = CallbackBridge::new(id.clone(), self.outbox.clone(), self.persisted.clone());
        match executor::execute(&self.root, operations, &bridge) {
            Ok(Value::Pending(promise)) => {
                tracing::debug!("awaiting pending result");
                let outbox = self.outbox.clone();
                tokio::task::spawn_local(
                    async move {
                        let outcome = executor::settle(Value::Pending(promise)).await;
                        respond(&outbox, id, outcome.as_ref().map_err(|error| &**error));
                    }
                    .instrument(span.clone()),
                );
            }
            Ok(value) => respond(&self.outbox, id, Ok(&value)),
            Err(error) => respond(&self.outbox, id, Err(&error)),
        }
    }
}

/// Send the single `SUCCESS` or `ERROR` envelope for a request.
fn respond(outbox: &Outbox, id: RequestId, outcome: Result<&Value, &anyhow::Error>) {
    let envelope = match outcome {
        Ok(value) => match value.to_transmissible() {
            Ok(result) => Outbound::Success { id, result },
            Err(error) => failure(id, &error),
        },
        Err(error) => failure(id, error),
    };
    if let Err(error) = outbox.send(envelope) {
        tracing::warn!(%error, "could not deliver response");
    }
}

fn failure(id: RequestId, error: &anyhow::Error) -> Outbound {
    tracing::warn!(%id, %error, "request failed");
    Outbound::Error {
        id,
        error: ErrorDescriptor::from_error(error),
    }
}
