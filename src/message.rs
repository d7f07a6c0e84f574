//! Messages exchanged over an endpoint.
//!
//! Inbound: `OPERATION` (a request carrying an operation chain) and `DISPOSE`
//! (release a persisted callback). Outbound: `SUCCESS`, `ERROR` and `CALLBACK`.
//! Every outbound envelope echoes the id of the request it belongs to.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorDescriptor, ProxyError};

pub const OPERATION: &str = "OPERATION";
pub const DISPOSE: &str = "DISPOSE";
pub const SUCCESS: &str = "SUCCESS";
pub const ERROR: &str = "ERROR";
pub const CALLBACK: &str = "CALLBACK";

/// The `type` tag that marks an `apply` argument as a remote function.
pub const FUNCTION_MARKER: &str = "FUNCTION";

/// Identifier chosen by the caller; echoed back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    /// Any JSON number, kept exactly as received.
    Number(serde_json::Number),
    String(String),
}

/// Correlates outbound envelopes with the `OPERATION` that caused them.
pub type RequestId = MessageId;

/// Identifies a callback placeholder (and the stand-ins created for it).
pub type ReferenceId = MessageId;

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Number(n) => write!(f, "{n}"),
            MessageId::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for MessageId {
    fn from(value: i64) -> Self {
        MessageId::Number(value.into())
    }
}

impl From<u64> for MessageId {
    fn from(value: u64) -> Self {
        MessageId::Number(value.into())
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        MessageId::String(value.to_string())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        MessageId::String(value)
    }
}

/// A property name. Integer keys on the wire (array indices) are normalised to
/// their decimal form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "KeyRepr")]
pub struct PropertyKey(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum KeyRepr {
    String(String),
    Integer(i64),
}

impl From<KeyRepr> for PropertyKey {
    fn from(repr: KeyRepr) -> Self {
        match repr {
            KeyRepr::String(s) => PropertyKey(s),
            KeyRepr::Integer(i) => PropertyKey(i.to_string()),
        }
    }
}

impl PropertyKey {
    pub fn new(key: impl Into<String>) -> Self {
        PropertyKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::ops::Deref for PropertyKey {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One step of an operation chain.
///
/// Unknown tags still deserialize (as [`Operation::Unsupported`]) so that the
/// failure happens when the chain reaches that step, not when the message is
/// parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawOperation", into = "RawOperation")]
pub enum Operation {
    Get {
        key: PropertyKey,
    },
    Set {
        key: PropertyKey,
        /// `None` when the message carried no `value` (assigns `undefined`).
        value: Option<serde_json::Value>,
    },
    Apply {
        key: PropertyKey,
        args: Vec<Argument>,
    },
    Unsupported {
        tag: String,
    },
}

impl Operation {
    /// The wire tag of this step.
    pub fn tag(&self) -> &str {
        match self {
            Operation::Get { .. } => "get",
            Operation::Set { .. } => "set",
            Operation::Apply { .. } => "apply",
            Operation::Unsupported { tag } => tag,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawOperation {
    #[serde(rename = "type")]
    kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<PropertyKey>,

    /// `Some(Null)` for an explicit `null`, `None` when absent.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    value: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<Vec<Argument>>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

impl TryFrom<RawOperation> for Operation {
    type Error = String;

    fn try_from(raw: RawOperation) -> Result<Self, Self::Error> {
        let RawOperation {
            kind,
            key,
            value,
            args,
        } = raw;
        let require_key = |key: Option<PropertyKey>| {
            key.ok_or_else(|| format!("`{kind}` operation is missing its key"))
        };
        match kind.as_str() {
            "get" => Ok(Operation::Get {
                key: require_key(key)?,
            }),
            "set" => Ok(Operation::Set {
                key: require_key(key)?,
                value,
            }),
            "apply" => Ok(Operation::Apply {
                key: require_key(key)?,
                args: args.unwrap_or_default(),
            }),
            _ => Ok(Operation::Unsupported { tag: kind }),
        }
    }
}

impl From<Operation> for RawOperation {
    fn from(operation: Operation) -> Self {
        match operation {
            Operation::Get { key } => RawOperation {
                kind: "get".to_string(),
                key: Some(key),
                value: None,
                args: None,
            },
            Operation::Set { key, value } => RawOperation {
                kind: "set".to_string(),
                key: Some(key),
                value,
                args: None,
            },
            Operation::Apply { key, args } => RawOperation {
                kind: "apply".to_string(),
                key: Some(key),
                value: None,
                args: Some(args),
            },
            Operation::Unsupported { tag } => RawOperation {
                kind: tag,
                key: None,
                value: None,
                args: None,
            },
        }
    }
}

/// An `apply` argument: plain data, or a placeholder for a remote function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Argument {
    Callback(CallbackPlaceholder),
    Value(serde_json::Value),
}

/// `{ "type": "FUNCTION", "ref": <id>, "persisted": <bool> }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPlaceholder {
    #[serde(rename = "type")]
    marker: FunctionMarker,

    #[serde(rename = "ref")]
    pub reference: ReferenceId,

    #[serde(default)]
    pub persisted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum FunctionMarker {
    #[serde(rename = "FUNCTION")]
    Function,
}

impl CallbackPlaceholder {
    pub fn new(reference: impl Into<ReferenceId>, persisted: bool) -> Self {
        Self {
            marker: FunctionMarker::Function,
            reference: reference.into(),
            persisted,
        }
    }
}

/// Messages the host listens for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Inbound {
    #[serde(rename = "OPERATION")]
    Operation { id: RequestId, data: Vec<Operation> },

    #[serde(rename = "DISPOSE")]
    Dispose {
        #[serde(rename = "ref")]
        reference: ReferenceId,
    },
}

/// What the listener should do with a raw inbound message.
#[derive(Debug)]
pub enum Classified {
    Message(Inbound),

    /// Not addressed to the proxy (unknown or missing `type`).
    Ignored,

    /// Addressed to the proxy but unusable. `id` is set when the message carried
    /// one the caller can correlate an error with.
    Malformed {
        id: Option<RequestId>,
        error: ProxyError,
    },
}

impl Inbound {
    /// Sort a raw message into proxy traffic, foreign traffic, or garbage.
    pub fn classify(message: serde_json::Value) -> Classified {
        let kind = message.get("type").and_then(serde_json::Value::as_str);
        if !matches!(kind, Some(OPERATION) | Some(DISPOSE)) {
            return Classified::Ignored;
        }

        let id = message
            .get("id")
            .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());

        match serde_json::from_value::<Inbound>(message) {
            Ok(inbound) => Classified::Message(inbound),
            Err(error) => Classified::Malformed {
                id,
                error: ProxyError::MalformedMessage(error),
            },
        }
    }
}

/// Arguments of one stand-in invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackInvocation {
    #[serde(rename = "ref")]
    pub reference: ReferenceId,
    pub args: Vec<serde_json::Value>,
}

/// Messages the host sends. None of them expects a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Outbound {
    #[serde(rename = "SUCCESS")]
    Success {
        id: RequestId,
        result: serde_json::Value,
    },

    #[serde(rename = "ERROR")]
    Error {
        id: RequestId,
        error: ErrorDescriptor,
    },

    #[serde(rename = "CALLBACK")]
    Callback {
        id: RequestId,
        func: CallbackInvocation,
    },
}

impl Outbound {
    pub fn id(&self) -> &RequestId {
        match self {
            Outbound::Success { id, .. }
            | Outbound::Error { id, .. }
            | Outbound::Callback { id, .. } => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use expect_test::expect;
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_an_operation_chain() {
        let inbound: Inbound = serde_json::from_value(json!({
            "type": "OPERATION",
            "id": "req-1",
            "data": [
                { "type": "get", "key": "items" },
                { "type": "get", "key": 0 },
                { "type": "set", "key": "done", "value": true },
            ]
        }))
        .unwrap();

        let Inbound::Operation { id, data } = inbound else {
            panic!("expected an operation");
        };
        assert_eq!(id, MessageId::from("req-1"));
        assert_eq!(
            data,
            vec![
                Operation::Get {
                    key: PropertyKey::new("items")
                },
                Operation::Get {
                    key: PropertyKey::new("0")
                },
                Operation::Set {
                    key: PropertyKey::new("done"),
                    value: Some(json!(true)),
                },
            ]
        );
    }

    #[test]
    fn unknown_tags_survive_parsing() {
        let operation: Operation =
            serde_json::from_value(json!({ "type": "delete", "key": "x" })).unwrap();
        assert_eq!(
            operation,
            Operation::Unsupported {
                tag: "delete".to_string()
            }
        );
    }

    #[test]
    fn explicit_null_differs_from_a_missing_value() {
        let explicit: Operation =
            serde_json::from_value(json!({ "type": "set", "key": "x", "value": null })).unwrap();
        assert_matches!(explicit, Operation::Set { value: Some(serde_json::Value::Null), .. });

        let missing: Operation =
            serde_json::from_value(json!({ "type": "set", "key": "x" })).unwrap();
        assert_matches!(missing, Operation::Set { value: None, .. });
    }

    #[test]
    fn known_tags_need_a_key() {
        let error = serde_json::from_value::<Operation>(json!({ "type": "get" })).unwrap_err();
        assert!(error.to_string().contains("`get` operation is missing its key"));
    }

    #[test]
    fn function_markers_become_placeholders() {
        let args: Vec<Argument> = serde_json::from_value(json!([
            1,
            { "type": "FUNCTION", "ref": 9, "persisted": true },
            { "type": "FUNCTION", "ref": "cb" },
            { "type": "OTHER", "ref": 3 },
        ]))
        .unwrap();

        assert_matches!(&args[0], Argument::Value(v) if v == &json!(1));
        assert_matches!(
            &args[1],
            Argument::Callback(p) if p == &CallbackPlaceholder::new(9_i64, true)
        );
        assert_matches!(
            &args[2],
            Argument::Callback(p) if p == &CallbackPlaceholder::new("cb", false)
        );
        assert_matches!(&args[3], Argument::Value(_));
    }

    #[test]
    fn classify_sorts_traffic() {
        assert_matches!(
            Inbound::classify(json!({ "type": "PING" })),
            Classified::Ignored
        );
        assert_matches!(Inbound::classify(json!("hello")), Classified::Ignored);
        assert_matches!(
            Inbound::classify(json!({ "type": "DISPOSE", "ref": 4 })),
            Classified::Message(Inbound::Dispose { reference }) if reference == MessageId::from(4_i64)
        );
        assert_matches!(
            Inbound::classify(json!({ "type": "OPERATION", "id": 3, "data": "nope" })),
            Classified::Malformed { id: Some(id), .. } if id == MessageId::from(3_i64)
        );
        assert_matches!(
            Inbound::classify(json!({ "type": "OPERATION", "data": [] })),
            Classified::Malformed { id: None, .. }
        );
    }

    #[test]
    fn wire_tags_match_the_published_names() {
        let id = MessageId::from(1_i64);
        let tag = |envelope: Outbound| serde_json::to_value(envelope).unwrap()["type"].clone();
        assert_eq!(
            tag(Outbound::Success { id: id.clone(), result: json!(null) }),
            SUCCESS
        );
        assert_eq!(
            tag(Outbound::Error {
                id: id.clone(),
                error: ErrorDescriptor {
                    name: "Error".to_string(),
                    message: String::new(),
                    stack: None,
                },
            }),
            ERROR
        );
        assert_eq!(
            tag(Outbound::Callback {
                id,
                func: CallbackInvocation { reference: MessageId::from("cb"), args: vec![] },
            }),
            CALLBACK
        );
        assert_eq!(
            serde_json::to_value(CallbackPlaceholder::new("cb", true)).unwrap()["type"],
            FUNCTION_MARKER
        );
    }

    #[test]
    fn any_json_number_is_a_usable_id() {
        for id in [json!(1.5), json!(u64::MAX), json!(-3)] {
            let Classified::Message(Inbound::Operation { id: parsed, .. }) =
                Inbound::classify(json!({ "type": "OPERATION", "id": id, "data": [] }))
            else {
                panic!("id {id} was not accepted");
            };
            assert_eq!(serde_json::to_value(&parsed).unwrap(), id);
        }
        assert_eq!(MessageId::from(u64::MAX).to_string(), "18446744073709551615");

        let argument: Argument =
            serde_json::from_value(json!({ "type": "FUNCTION", "ref": 2.5 })).unwrap();
        assert_matches!(argument, Argument::Callback(p) if p.reference.to_string() == "2.5");
    }

    #[test]
    fn outbound_envelopes_have_the_documented_shape() {
        let envelope = Outbound::Callback {
            id: MessageId::from(1_i64),
            func: CallbackInvocation {
                reference: MessageId::from("cb"),
                args: vec![json!(1), json!("two")],
            },
        };
        expect![[r#"{"type":"CALLBACK","id":1,"func":{"ref":"cb","args":[1,"two"]}}"#]]
            .assert_eq(&serde_json::to_string(&envelope).unwrap());
    }
}
