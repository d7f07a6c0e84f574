//! farcall: drive a live object from the other side of a message channel.
//!
//! The object stays in the context that owns it. A caller on the far side of a
//! structured-message [`Endpoint`] describes a chain of `get`/`set`/`apply`
//! operations; the host replays that chain against the object and answers with a
//! single `SUCCESS` or `ERROR` envelope. Functions passed as arguments cross the
//! boundary as placeholders and come back to life as stand-ins that report their
//! invocations over the channel.
//!
//! ```text
//! caller --OPERATION--> [listener] -> executor -> object
//!        <--CALLBACK--- stand-in  <-------------'
//!        <--SUCCESS/ERROR-------------'
//! ```
//!
//! Everything here is single-threaded: bindings are driven by local tasks and must
//! be created from within a [`tokio::task::LocalSet`].

pub mod bridge;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod host;
pub mod logging;
pub mod message;
pub mod registry;
pub mod value;

pub use bridge::{CallbackBridge, PersistedRefs};
pub use endpoint::{Endpoint, EndpointId, Outbox, Port, channel};
pub use error::{ErrorDescriptor, Exception, ProxyError};
pub use message::{
    Argument, CallbackInvocation, CallbackPlaceholder, Inbound, MessageId, Operation, Outbound,
    PropertyKey, ReferenceId, RequestId,
};
pub use registry::{ProxyHandle, Registry};
pub use value::{Callable, Promise, Record, RemoteObject, Value};
