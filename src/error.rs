//! Failure kinds and their transmissible form.
//!
//! A thrown error cannot cross the channel as a live value, so every failure that
//! ends a request is flattened into an [`ErrorDescriptor`] before it is sent.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::endpoint::EndpointId;
use crate::message::ReferenceId;

/// Errors raised by the proxy machinery itself.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// `bind` was called for an endpoint that already has a live binding.
    #[error("endpoint {endpoint} already has an active proxy binding")]
    DuplicateBinding { endpoint: EndpointId },

    /// An `apply` step targeted a property that is not a function.
    #[error("property '{key}' is not a function")]
    NotCallable { key: String },

    /// An operation carried a tag other than `get`, `set` or `apply`.
    #[error("unsupported operation type '{tag}'")]
    UnsupportedOperation { tag: String },

    /// A stand-in was invoked again after its single use, or after its
    /// reference was disposed.
    #[error("callback {reference} has been disposed")]
    CallbackDisposed { reference: ReferenceId },

    /// A value could not be turned into message data.
    #[error("{what} could not be cloned")]
    DataClone { what: String },

    /// A property access on a value that has no properties.
    #[error("{0}")]
    Type(String),

    /// An inbound message had a recognised type but an unusable payload.
    #[error("malformed message: {0}")]
    MalformedMessage(#[source] serde_json::Error),

    #[error("message channel is closed")]
    ChannelClosed,
}

impl ProxyError {
    /// The name reported in an [`ErrorDescriptor`] for this kind of failure.
    pub fn name(&self) -> &'static str {
        match self {
            ProxyError::DuplicateBinding { .. } => "DuplicateBindingError",
            ProxyError::NotCallable { .. } => "NotCallableError",
            ProxyError::UnsupportedOperation { .. } => "UnsupportedOperationError",
            ProxyError::CallbackDisposed { .. } => "CallbackDisposedError",
            ProxyError::DataClone { .. } => "DataCloneError",
            ProxyError::Type(_) => "TypeError",
            ProxyError::MalformedMessage(_) => "MalformedMessageError",
            ProxyError::ChannelClosed => "ChannelClosedError",
        }
    }

    pub(crate) fn data_clone(what: impl Into<String>) -> Self {
        ProxyError::DataClone { what: what.into() }
    }
}

/// A named error thrown by object logic.
///
/// Object methods return `anyhow::Result`, so any error type works; use an
/// `Exception` when the caller should see a specific `name`.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct Exception {
    name: String,
    message: String,
    stack: Option<String>,
}

impl Exception {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Attach a stack to report verbatim instead of the rendered cause chain.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// The diagnostic shape of an error as it travels in an `ERROR` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
}

impl ErrorDescriptor {
    /// Flatten an error (and its causes) into a descriptor.
    ///
    /// The name comes from the outermost [`ProxyError`] or [`Exception`] in the
    /// chain, falling back to `Error`. The message is the outermost display. The
    /// stack is an explicit [`Exception`] stack if one exists, otherwise the cause
    /// chain, otherwise `None`.
    pub fn from_error(error: &anyhow::Error) -> Self {
        let name = error
            .chain()
            .find_map(|cause| {
                if let Some(proxy_error) = cause.downcast_ref::<ProxyError>() {
                    Some(proxy_error.name().to_string())
                } else {
                    cause
                        .downcast_ref::<Exception>()
                        .map(|exception| exception.name.clone())
                }
            })
            .unwrap_or_else(|| "Error".to_string());

        let message = error.to_string();

        let explicit_stack = error.chain().find_map(|cause| {
            cause
                .downcast_ref::<Exception>()
                .and_then(|exception| exception.stack.clone())
        });

        let stack = explicit_stack.or_else(|| {
            let causes: Vec<String> = error
                .chain()
                .skip(1)
                .map(|cause| format!("    caused by: {cause}"))
                .collect();
            if causes.is_empty() {
                None
            } else {
                Some(format!("{name}: {message}\n{}", causes.join("\n")))
            }
        });

        Self {
            name,
            message,
            stack,
        }
    }
}
