//! Replays an operation chain against a value.
//!
//! Steps run left to right, each on the result of the previous one, starting at
//! the bound object. The first failing step ends the chain.

use std::rc::Rc;

use crate::bridge::CallbackBridge;
use crate::error::ProxyError;
use crate::message::Operation;
use crate::value::Value;

/// Run `operations` starting from `target` and return the terminal value.
///
/// The terminal value may be [`Value::Pending`]; use [`settle`] to wait for it.
pub fn execute(
    target: &Value,
    operations: Vec<Operation>,
    bridge: &CallbackBridge,
) -> anyhow::Result<Value> {
    let mut current = target.clone();
    for (index, operation) in operations.into_iter().enumerate() {
        tracing::debug!(index, tag = operation.tag(), on = current.kind(), "applying step");
        current = step(&current, operation, bridge)?;
    }
    Ok(current)
}

fn step(current: &Value, operation: Operation, bridge: &CallbackBridge) -> anyhow::Result<Value> {
    match operation {
        Operation::Get { key } => current.get(&key),
        Operation::Set { key, value } => {
            let value = value.map(Value::live).unwrap_or(Value::Undefined);
            let assigned = current.set(&key, value)?;
            Ok(Value::Json(assigned.into()))
        }
        Operation::Apply { key, args } => {
            let args = bridge.transform_arguments(args);
            current.call_method(&key, args)
        }
        Operation::Unsupported { tag } => Err(ProxyError::UnsupportedOperation { tag }.into()),
    }
}

/// Wait for a terminal value. Pending values are awaited, including pending
/// values that resolve to further pending values; anything else is returned
/// as is.
pub async fn settle(value: Value) -> Result<Value, Rc<anyhow::Error>> {
    let mut value = value;
    while let Value::Pending(promise) = value {
        value = promise.outcome().await?;
    }
    Ok(value)
}
