//! Dynamic values that an operation chain walks through.
//!
//! The bound object is reached through the [`RemoteObject`] capability
//! (`get`/`set`/`call`); plain message data stays as `serde_json::Value`; live
//! functions and pending results have their own variants. Every step of a chain
//! checks the kind of the current value at runtime.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use futures::FutureExt as _;
use futures::future::{LocalBoxFuture, Shared};

use crate::error::ProxyError;

/// A value inside the host.
#[derive(Clone)]
pub enum Value {
    Undefined,

    /// Detached message data (including `null`).
    Json(serde_json::Value),

    /// A live object with properties of its own.
    Object(Rc<dyn RemoteObject>),

    Function(Rc<dyn Callable>),

    /// A result that is not available yet.
    Pending(Promise),
}

/// The capability an exposed object offers to the executor.
pub trait RemoteObject {
    /// Read a property. Missing properties are `Value::Undefined`.
    fn get(&self, key: &str) -> anyhow::Result<Value>;

    /// Assign a property, returning whether the assignment took effect.
    #[allow(unused_variables)]
    fn set(&self, key: &str, value: Value) -> anyhow::Result<bool> {
        Ok(false)
    }

    /// Invoke the function stored under `key`.
    ///
    /// Override this to dispatch methods directly instead of exposing them as
    /// function-valued properties.
    fn call(&self, key: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        match self.get(key)? {
            Value::Function(function) => function.call(args),
            _ => Err(ProxyError::NotCallable {
                key: key.to_string(),
            }
            .into()),
        }
    }

    /// Message data for this object, used when it is the result of a request.
    fn snapshot(&self) -> anyhow::Result<serde_json::Value> {
        Err(ProxyError::data_clone("object").into())
    }
}

/// Something that can be invoked with a list of values.
pub trait Callable {
    fn call(&self, args: Vec<Value>) -> anyhow::Result<Value>;
}

struct NativeFunction<F>(F);

impl<F> Callable for NativeFunction<F>
where
    F: Fn(Vec<Value>) -> anyhow::Result<Value>,
{
    fn call(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        (self.0)(args)
    }
}

type Settled = Result<Value, Rc<anyhow::Error>>;

/// A pending result. Cloning shares the same underlying computation.
#[derive(Clone)]
pub struct Promise {
    inner: Shared<LocalBoxFuture<'static, Settled>>,
}

impl Promise {
    pub fn new(future: impl Future<Output = anyhow::Result<Value>> + 'static) -> Self {
        Self {
            inner: future
                .map(|result| result.map_err(Rc::new))
                .boxed_local()
                .shared(),
        }
    }

    pub fn resolved(value: Value) -> Self {
        Promise::new(futures::future::ready(Ok(value)))
    }

    pub fn rejected(error: anyhow::Error) -> Self {
        Promise::new(futures::future::ready(Err(error)))
    }

    /// Wait for this promise (only this one; see `executor::settle` for chains).
    pub async fn outcome(self) -> Result<Value, Rc<anyhow::Error>> {
        self.inner.await
    }
}

impl Value {
    pub fn object(object: impl RemoteObject + 'static) -> Value {
        Value::Object(Rc::new(object))
    }

    pub fn function(function: impl Fn(Vec<Value>) -> anyhow::Result<Value> + 'static) -> Value {
        Value::Function(Rc::new(NativeFunction(function)))
    }

    pub fn pending(future: impl Future<Output = anyhow::Result<Value>> + 'static) -> Value {
        Value::Pending(Promise::new(future))
    }

    pub fn null() -> Value {
        Value::Json(serde_json::Value::Null)
    }

    /// Message data as a host value that later steps can assign into: JSON
    /// objects become [`Record`]s, recursively. Arrays and primitives stay data.
    pub fn live(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Object(members) => Value::object(Record::from_members(members)),
            other => Value::Json(other),
        }
    }

    /// A short name for the kind of this value, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Json(serde_json::Value::Null) => "null",
            Value::Json(serde_json::Value::Bool(_)) => "boolean",
            Value::Json(serde_json::Value::Number(_)) => "number",
            Value::Json(serde_json::Value::String(_)) => "string",
            Value::Json(serde_json::Value::Array(_)) => "array",
            Value::Json(serde_json::Value::Object(_)) | Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Pending(_) => "promise",
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(json) => Some(json),
            _ => None,
        }
    }

    fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Json(serde_json::Value::Null))
    }

    /// Read property `key` off this value.
    pub fn get(&self, key: &str) -> anyhow::Result<Value> {
        if self.is_nullish() {
            return Err(ProxyError::Type(format!(
                "Cannot read properties of {} (reading '{key}')",
                self.kind()
            ))
            .into());
        }
        match self {
            Value::Object(object) => object.get(key),
            Value::Json(json) => Ok(json_property(json, key)),
            _ => Ok(Value::Undefined),
        }
    }

    /// Assign property `key` on this value. Detached data and primitives accept
    /// nothing and report `false`.
    pub fn set(&self, key: &str, value: Value) -> anyhow::Result<bool> {
        if self.is_nullish() {
            return Err(ProxyError::Type(format!(
                "Cannot set properties of {} (setting '{key}')",
                self.kind()
            ))
            .into());
        }
        match self {
            Value::Object(object) => object.set(key, value),
            _ => Ok(false),
        }
    }

    /// Invoke the function stored under `key` with this value as its owner.
    pub fn call_method(&self, key: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        if let Value::Object(object) = self {
            return object.call(key, args);
        }
        match self.get(key)? {
            Value::Function(function) => function.call(args),
            _ => Err(ProxyError::NotCallable {
                key: key.to_string(),
            }
            .into()),
        }
    }

    /// Invoke this value directly.
    pub fn invoke(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        match self {
            Value::Function(function) => function.call(args),
            other => Err(ProxyError::Type(format!("{} is not a function", other.kind())).into()),
        }
    }

    /// Message data for this value, following structured-clone rules:
    /// functions and pending values cannot be cloned.
    pub fn to_transmissible(&self) -> anyhow::Result<serde_json::Value> {
        match self {
            Value::Undefined => Ok(serde_json::Value::Null),
            Value::Json(json) => Ok(json.clone()),
            Value::Object(object) => object.snapshot(),
            Value::Function(_) => Err(ProxyError::data_clone("function").into()),
            Value::Pending(_) => Err(ProxyError::data_clone("promise").into()),
        }
    }
}

fn json_property(json: &serde_json::Value, key: &str) -> Value {
    let found = match json {
        serde_json::Value::Object(members) => members.get(key).cloned(),
        serde_json::Value::Array(items) if key == "length" => Some(items.len().into()),
        serde_json::Value::Array(items) => key
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get(index))
            .cloned(),
        serde_json::Value::String(text) if key == "length" => Some(text.chars().count().into()),
        serde_json::Value::String(text) => key
            .parse::<usize>()
            .ok()
            .and_then(|index| text.chars().nth(index))
            .map(|c| c.to_string().into()),
        _ => None,
    };
    found.map(Value::Json).unwrap_or(Value::Undefined)
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::Json(json)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("Undefined"),
            Value::Json(json) => f.debug_tuple("Json").field(json).finish(),
            Value::Object(_) => f.write_str("Object(..)"),
            Value::Function(_) => f.write_str("Function(..)"),
            Value::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

/// A shared, mutable bag of properties: the host-side counterpart of a plain
/// object literal.
#[derive(Debug, Default)]
pub struct Record {
    properties: RefCell<BTreeMap<String, Value>>,
    frozen: Cell<bool>,

    /// Set while a snapshot of this record is being taken.
    snapshotting: Cell<bool>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from a JSON object. Nested objects become records of
    /// their own so they can be assigned through as well.
    pub fn from_json(json: serde_json::Value) -> Result<Self, ProxyError> {
        match json {
            serde_json::Value::Object(members) => Ok(Record::from_members(members)),
            other => Err(ProxyError::Type(format!(
                "expected an object to build a record from, found {}",
                Value::Json(other).kind()
            ))),
        }
    }

    fn from_members(members: serde_json::Map<String, serde_json::Value>) -> Self {
        let record = Record::new();
        for (key, member) in members {
            record.insert(key, Value::live(member));
        }
        record
    }

    /// Builder-style [`Record::insert`].
    pub fn with(self, key: impl Into<String>, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    /// Store a property regardless of the frozen flag.
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.properties.borrow_mut().insert(key.into(), value);
    }

    pub fn property(&self, key: &str) -> Option<Value> {
        self.properties.borrow().get(key).cloned()
    }

    /// Make every later `set` report `false`.
    pub fn freeze(&self) {
        self.frozen.set(true);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.get()
    }
}

impl Record {
    fn snapshot_members(&self) -> anyhow::Result<serde_json::Value> {
        let properties = self.properties.borrow();
        let mut members = serde_json::Map::new();
        for (key, value) in properties.iter() {
            members.insert(key.clone(), value.to_transmissible()?);
        }
        Ok(serde_json::Value::Object(members))
    }
}

impl RemoteObject for Record {
    fn get(&self, key: &str) -> anyhow::Result<Value> {
        Ok(self.property(key).unwrap_or(Value::Undefined))
    }

    fn set(&self, key: &str, value: Value) -> anyhow::Result<bool> {
        if self.is_frozen() {
            return Ok(false);
        }
        self.insert(key, value);
        Ok(true)
    }

    /// Fails with `DataCloneError` if the record (indirectly) contains itself.
    fn snapshot(&self) -> anyhow::Result<serde_json::Value> {
        if self.snapshotting.replace(true) {
            return Err(ProxyError::data_clone("cyclic record").into());
        }
        let snapshot = self.snapshot_members();
        self.snapshotting.set(false);
        snapshot
    }
}
