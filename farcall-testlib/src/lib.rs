//! Test harness for farcall.
//!
//! [`TestCaller`] plays the far side of a channel: it posts `OPERATION` and
//! `DISPOSE` messages and reads back the host's envelopes with a timeout so a
//! missing reply fails the test instead of hanging it.

use std::time::Duration;

use farcall::{Endpoint, Outbound, Port, RequestId};
use serde_json::{Value, json};

/// How long [`TestCaller::recv`] waits before giving up.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// How long [`TestCaller::assert_silent`] listens.
pub const SILENCE: Duration = Duration::from_millis(50);

/// Install a test-friendly subscriber. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("farcall=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// The caller's side of a channel.
pub struct TestCaller {
    port: Port,
}

impl TestCaller {
    /// A fresh channel: the endpoint to bind, and the caller driving it.
    pub fn connect() -> (Endpoint, TestCaller) {
        let (endpoint, port) = farcall::channel();
        (endpoint, TestCaller { port })
    }

    /// Post a raw message.
    pub fn send(&self, message: Value) {
        self.port
            .post_message(message)
            .expect("host side of the channel is gone");
    }

    /// Post an `OPERATION` request.
    pub fn operation(&self, id: impl Into<Value>, chain: Chain) {
        self.send(json!({ "type": "OPERATION", "id": id.into(), "data": chain.steps }));
    }

    /// Post a `DISPOSE` for a persisted callback.
    pub fn dispose(&self, reference: impl Into<Value>) {
        self.send(json!({ "type": "DISPOSE", "ref": reference.into() }));
    }

    /// Stop sending; the listener ends once it has drained the queue.
    pub fn close(&self) {
        self.port.close();
    }

    /// The next raw message from the host.
    pub async fn recv_json(&mut self) -> Value {
        tokio::time::timeout(RECV_TIMEOUT, self.port.recv())
            .await
            .expect("timed out waiting for the host")
            .expect("host closed the channel")
    }

    /// The next envelope from the host.
    pub async fn recv(&mut self) -> Outbound {
        let message = self.recv_json().await;
        serde_json::from_value(message.clone())
            .unwrap_or_else(|error| panic!("unexpected message {message}: {error}"))
    }

    /// The next envelope, rendered as compact JSON with sorted keys. Handy for
    /// `expect!` snapshots.
    pub async fn recv_compact(&mut self) -> String {
        let message = self.recv_json().await;
        serde_json::to_string(&message).expect("json values always serialize")
    }

    /// The next envelope must be the `SUCCESS` for `id`.
    pub async fn expect_success(&mut self, id: impl Into<Value>) -> Value {
        let id = id.into();
        match self.recv().await {
            Outbound::Success { id: got, result } if same_id(&got, &id) => result,
            other => panic!("expected SUCCESS for {id}, got {other:?}"),
        }
    }

    /// The next envelope must be the `ERROR` for `id`; returns `(name, message)`.
    pub async fn expect_error(&mut self, id: impl Into<Value>) -> (String, String) {
        let id = id.into();
        match self.recv().await {
            Outbound::Error { id: got, error } if same_id(&got, &id) => {
                (error.name, error.message)
            }
            other => panic!("expected ERROR for {id}, got {other:?}"),
        }
    }

    /// Fail if the host sends anything within [`SILENCE`].
    pub async fn assert_silent(&mut self) {
        if let Ok(message) = tokio::time::timeout(SILENCE, self.port.recv()).await {
            panic!("expected no message, got {message:?}");
        }
    }

    /// `true` once the host has dropped every sender for this channel.
    pub async fn is_hung_up(&mut self) -> bool {
        matches!(
            tokio::time::timeout(RECV_TIMEOUT, self.port.recv()).await,
            Ok(None)
        )
    }
}

fn same_id(got: &RequestId, expected: &Value) -> bool {
    serde_json::to_value(got).is_ok_and(|got| &got == expected)
}

/// Builds the `data` array of an `OPERATION` message.
#[derive(Default, Clone)]
pub struct Chain {
    steps: Vec<Value>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(mut self, key: impl Into<Value>) -> Self {
        self.steps.push(json!({ "type": "get", "key": key.into() }));
        self
    }

    pub fn set(mut self, key: impl Into<Value>, value: impl Into<Value>) -> Self {
        self.steps
            .push(json!({ "type": "set", "key": key.into(), "value": value.into() }));
        self
    }

    pub fn apply(mut self, key: impl Into<Value>, args: Vec<Value>) -> Self {
        self.steps
            .push(json!({ "type": "apply", "key": key.into(), "args": args }));
        self
    }

    /// Append an arbitrary step.
    pub fn raw(mut self, step: Value) -> Self {
        self.steps.push(step);
        self
    }
}

/// A function placeholder argument.
pub fn callback(reference: impl Into<Value>, persisted: bool) -> Value {
    json!({ "type": "FUNCTION", "ref": reference.into(), "persisted": persisted })
}
