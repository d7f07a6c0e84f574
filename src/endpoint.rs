//! Structured-message channel endpoints.
//!
//! An [`Endpoint`] is the host's side of a duplex channel: it receives inbound
//! messages and sends envelopes through its [`Outbox`]. The caller holds the
//! matching [`Port`]. Messages are `serde_json::Value`s; how they are framed on a
//! real transport is up to whoever feeds the channels (see [`crate::host`]).

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use futures::StreamExt as _;
use futures::channel::mpsc;
use uuid::Uuid;

use crate::error::ProxyError;
use crate::message::Outbound;

/// Identity of an endpoint. Clones of an [`Endpoint`] share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(Uuid);

impl EndpointId {
    fn fresh() -> Self {
        EndpointId(Uuid::new_v4())
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The host side of a channel.
#[derive(Clone)]
pub struct Endpoint {
    id: EndpointId,
    outbox: Outbox,
    inbox: Inbox,
}

impl Endpoint {
    /// Wrap an existing pair of channels: `outgoing` carries envelopes to the
    /// caller, `incoming` delivers the caller's messages.
    pub fn new(
        outgoing: mpsc::UnboundedSender<serde_json::Value>,
        incoming: mpsc::UnboundedReceiver<serde_json::Value>,
    ) -> Self {
        Self {
            id: EndpointId::fresh(),
            outbox: Outbox { tx: outgoing },
            inbox: Inbox(Rc::new(InboxState {
                rx: RefCell::new(incoming),
                retired: Cell::new(false),
            })),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    pub(crate) fn inbox(&self) -> Inbox {
        self.inbox.clone()
    }
}

/// Create a connected host [`Endpoint`] and caller [`Port`].
pub fn channel() -> (Endpoint, Port) {
    let (to_host, host_rx) = mpsc::unbounded();
    let (to_caller, caller_rx) = mpsc::unbounded();
    let endpoint = Endpoint::new(to_caller, host_rx);
    let port = Port {
        endpoint: endpoint.id(),
        outgoing: to_host,
        incoming: caller_rx,
    };
    (endpoint, port)
}

/// Sends outbound envelopes. Cheap to clone; stand-ins keep one each.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<serde_json::Value>,
}

impl Outbox {
    pub fn send(&self, envelope: Outbound) -> Result<(), ProxyError> {
        let message = serde_json::to_value(&envelope)
            .map_err(|error| ProxyError::data_clone(format!("envelope ({error})")))?;
        tracing::trace!(?message, "posting message");
        self.tx
            .unbounded_send(message)
            .map_err(|_| ProxyError::ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Inbound queue of an endpoint. Shared by every clone of the endpoint; only
/// one listener polls it at a time.
#[derive(Clone)]
pub(crate) struct Inbox(Rc<InboxState>);

struct InboxState {
    rx: RefCell<mpsc::UnboundedReceiver<serde_json::Value>>,

    /// Set when a binding is disposed; cleared by the next binding.
    retired: Cell<bool>,
}

impl Inbox {
    /// The next inbound message, or `None` once the caller side is gone.
    ///
    /// The receiver is only borrowed for the duration of each poll, never across
    /// an await point.
    pub(crate) async fn next(&self) -> Option<serde_json::Value> {
        futures::future::poll_fn(|cx| self.0.rx.borrow_mut().poll_next_unpin(cx)).await
    }

    /// Mark the queue as belonging to no binding and drop what is waiting in it.
    pub(crate) fn retire(&self) {
        self.0.retired.set(true);
        self.discard_queued();
    }

    /// Prepare the queue for a new binding. Messages that arrived after the
    /// previous binding was disposed were meant for it and are dropped.
    pub(crate) fn adopt(&self) {
        if self.0.retired.replace(false) {
            self.discard_queued();
        }
    }

    fn discard_queued(&self) {
        let mut rx = self.0.rx.borrow_mut();
        while let Ok(Some(message)) = rx.try_next() {
            tracing::warn!(?message, "dropping message sent to a disposed binding");
        }
    }
}

/// The caller's side of a channel created by [`channel`].
pub struct Port {
    endpoint: EndpointId,
    outgoing: mpsc::UnboundedSender<serde_json::Value>,
    incoming: mpsc::UnboundedReceiver<serde_json::Value>,
}

impl Port {
    /// Id of the host endpoint this port talks to.
    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint
    }

    pub fn post_message(&self, message: serde_json::Value) -> Result<(), ProxyError> {
        self.outgoing
            .unbounded_send(message)
            .map_err(|_| ProxyError::ChannelClosed)
    }

    /// The next message from the host, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        self.incoming.next().await
    }

    /// Stop sending; the host's listener ends after draining what was sent.
    pub fn close(&self) {
        self.outgoing.close_channel();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::message::MessageId;

    #[tokio::test(flavor = "current_thread")]
    async fn messages_flow_both_ways() {
        let (endpoint, mut port) = channel();
        assert_eq!(port.endpoint_id(), endpoint.id());

        port.post_message(json!({ "type": "PING" })).unwrap();
        assert_eq!(endpoint.inbox().next().await, Some(json!({ "type": "PING" })));

        endpoint
            .outbox()
            .send(Outbound::Success {
                id: MessageId::from(1_i64),
                result: json!(true),
            })
            .unwrap();
        assert_eq!(
            port.recv().await,
            Some(json!({ "type": "SUCCESS", "id": 1, "result": true }))
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn closing_the_port_ends_the_inbox() {
        let (endpoint, port) = channel();
        port.post_message(json!(1)).unwrap();
        port.close();
        assert_eq!(endpoint.inbox().next().await, Some(json!(1)));
        assert_eq!(endpoint.inbox().next().await, None);
        assert!(port.post_message(json!(2)).is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn retired_inbox_drops_stale_messages() {
        let (endpoint, port) = channel();
        let inbox = endpoint.inbox();

        port.post_message(json!(1)).unwrap();
        inbox.retire();
        port.post_message(json!(2)).unwrap();
        inbox.adopt();
        port.post_message(json!(3)).unwrap();
        assert_eq!(inbox.next().await, Some(json!(3)));

        // Adopting a queue that was never retired keeps its messages.
        port.post_message(json!(4)).unwrap();
        inbox.adopt();
        assert_eq!(inbox.next().await, Some(json!(4)));
    }

    #[test]
    fn clones_share_identity() {
        let (endpoint, _port) = channel();
        let (other, _other_port) = channel();
        assert_eq!(endpoint.clone().id(), endpoint.id());
        assert_ne!(endpoint.id(), other.id());
    }

    #[test]
    fn sending_to_a_dropped_port_fails() {
        let (endpoint, port) = channel();
        drop(port);
        let error = endpoint
            .outbox()
            .send(Outbound::Success {
                id: MessageId::from(1_i64),
                result: json!(null),
            })
            .unwrap_err();
        assert_eq!(error.name(), "ChannelClosedError");
        assert!(endpoint.outbox().is_closed());
    }
}
