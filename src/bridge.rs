//! Callback bridge: turns function placeholders into local stand-ins.
//!
//! A caller cannot send a function, so it sends a placeholder carrying a
//! reference id. The bridge swaps each placeholder for a [`StandIn`] that, when
//! invoked by object code, posts a `CALLBACK` envelope with its arguments.
//!
//! A stand-in fires once. It may fire again only while its reference is in the
//! binding's [`PersistedRefs`]; a `DISPOSE` message removes the reference.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

use crate::endpoint::Outbox;
use crate::error::ProxyError;
use crate::message::{Argument, CallbackInvocation, Outbound, ReferenceId, RequestId};
use crate::value::{Callable, Value};

/// References whose stand-ins may fire more than once.
///
/// Owned by a binding and shared with every request and stand-in it creates.
#[derive(Clone, Default)]
pub struct PersistedRefs {
    refs: Rc<RefCell<HashSet<ReferenceId>>>,
}

impl PersistedRefs {
    pub fn insert(&self, reference: ReferenceId) {
        self.refs.borrow_mut().insert(reference);
    }

    /// Returns whether the reference was present.
    pub fn remove(&self, reference: &ReferenceId) -> bool {
        self.refs.borrow_mut().remove(reference)
    }

    pub fn contains(&self, reference: &ReferenceId) -> bool {
        self.refs.borrow().contains(reference)
    }

    pub fn is_empty(&self) -> bool {
        self.refs.borrow().is_empty()
    }
}

/// Argument transform for one inbound request.
pub struct CallbackBridge {
    request: RequestId,
    outbox: Outbox,
    persisted: PersistedRefs,
}

impl CallbackBridge {
    pub fn new(request: RequestId, outbox: Outbox, persisted: PersistedRefs) -> Self {
        Self {
            request,
            outbox,
            persisted,
        }
    }

    /// Plain data passes through; a placeholder becomes a fresh stand-in.
    pub fn transform_argument(&self, argument: Argument) -> Value {
        match argument {
            Argument::Value(json) => Value::Json(json),
            Argument::Callback(placeholder) => {
                if placeholder.persisted {
                    self.persisted.insert(placeholder.reference.clone());
                }
                tracing::debug!(
                    reference = %placeholder.reference,
                    persisted = placeholder.persisted,
                    "created callback stand-in"
                );
                Value::Function(Rc::new(StandIn {
                    request: self.request.clone(),
                    reference: placeholder.reference,
                    outbox: self.outbox.clone(),
                    persisted: self.persisted.clone(),
                    fired: Cell::new(false),
                }))
            }
        }
    }

    pub fn transform_arguments(&self, arguments: Vec<Argument>) -> Vec<Value> {
        arguments
            .into_iter()
            .map(|argument| self.transform_argument(argument))
            .collect()
    }
}

/// Local callable standing in for a caller's function.
pub struct StandIn {
    request: RequestId,
    reference: ReferenceId,
    outbox: Outbox,
    persisted: PersistedRefs,
    fired: Cell<bool>,
}

impl Callable for StandIn {
    fn call(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        if self.fired.get() && !self.persisted.contains(&self.reference) {
            tracing::debug!(reference = %self.reference, "stand-in invoked after disposal");
            return Err(ProxyError::CallbackDisposed {
                reference: self.reference.clone(),
            }
            .into());
        }

        let args = args
            .iter()
            .map(Value::to_transmissible)
            .collect::<anyhow::Result<Vec<_>>>()?;

        self.outbox.send(Outbound::Callback {
            id: self.request.clone(),
            func: CallbackInvocation {
                reference: self.reference.clone(),
                args,
            },
        })?;
        self.fired.set(true);
        Ok(Value::Undefined)
    }
}
