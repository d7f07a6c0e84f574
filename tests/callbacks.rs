//! Function arguments crossing the channel as placeholders.

use std::cell::RefCell;
use std::rc::Rc;

use expect_test::expect;
use farcall::{MessageId, Outbound, ProxyHandle, Record, Registry, Value};
use farcall_testlib::{Chain, TestCaller, callback};
use serde_json::json;
use tokio::task::LocalSet;

fn bind(record: Record) -> (ProxyHandle, TestCaller) {
    farcall_testlib::init_tracing();
    let (endpoint, caller) = TestCaller::connect();
    let handle = Registry::new()
        .bind(Rc::new(record), &endpoint)
        .expect("fresh endpoint");
    (handle, caller)
}

/// `each(list, cb)` calls `cb(item)` per item; `twice(cb)` calls `cb` twice.
fn iterating() -> Record {
    Record::new()
        .with(
            "each",
            Value::function(|args| {
                let items = args
                    .first()
                    .and_then(Value::as_json)
                    .and_then(serde_json::Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for item in items {
                    args[1].invoke(vec![Value::from(item)])?;
                }
                Ok(Value::Undefined)
            }),
        )
        .with(
            "twice",
            Value::function(|args| {
                args[0].invoke(vec![Value::from(json!(1))])?;
                args[0].invoke(vec![Value::from(json!(2))])?;
                Ok(Value::Undefined)
            }),
        )
        .with(
            "leak",
            Value::function(|args| {
                args[0].invoke(vec![Value::function(|_| Ok(Value::Undefined))])
            }),
        )
}

/// `subscribe(cb)` keeps `cb`; `emit(value)` calls every kept callback.
fn emitter() -> Record {
    let listeners: Rc<RefCell<Vec<Value>>> = Rc::default();
    let kept = listeners.clone();
    Record::new()
        .with(
            "subscribe",
            Value::function(move |mut args| {
                if !args.is_empty() {
                    kept.borrow_mut().push(args.remove(0));
                }
                Ok(Value::Undefined)
            }),
        )
        .with(
            "emit",
            Value::function(move |args| {
                let value = args.first().cloned().unwrap_or(Value::Undefined);
                let listeners = listeners.borrow().clone();
                for listener in &listeners {
                    listener.invoke(vec![value.clone()])?;
                }
                Ok(Value::from(json!(listeners.len())))
            }),
        )
}

#[tokio::test(flavor = "current_thread")]
async fn one_shot_callback_fires_once() {
    LocalSet::new()
        .run_until(async {
            let (_handle, mut caller) = bind(iterating());
            caller.operation(1, Chain::new().apply("twice", vec![callback("cb", false)]));

            expect![[r#"{"func":{"args":[1],"ref":"cb"},"id":1,"type":"CALLBACK"}"#]]
                .assert_eq(&caller.recv_compact().await);
            let (name, message) = caller.expect_error(1).await;
            assert_eq!(name, "CallbackDisposedError");
            assert_eq!(message, "callback cb has been disposed");
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn persisted_callback_fires_for_every_item() {
    LocalSet::new()
        .run_until(async {
            let (_handle, mut caller) = bind(iterating());
            caller.operation(
                7,
                Chain::new().apply("each", vec![json!(["a", "b", "c"]), callback(3, true)]),
            );

            for expected in ["a", "b", "c"] {
                let envelope = caller.recv().await;
                assert_eq!(envelope.id(), &MessageId::from(7_i64));
                match envelope {
                    Outbound::Callback { func, .. } => {
                        assert_eq!(func.reference, MessageId::from(3_i64));
                        assert_eq!(func.args, vec![json!(expected)]);
                    }
                    other => panic!("expected a callback, got {other:?}"),
                }
            }
            assert_eq!(caller.expect_success(7).await, json!(null));
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn persisted_callback_outlives_its_request_until_disposed() {
    LocalSet::new()
        .run_until(async {
            let (_handle, mut caller) = bind(emitter());

            caller.operation(1, Chain::new().apply("subscribe", vec![callback("on-data", true)]));
            assert_eq!(caller.expect_success(1).await, json!(null));

            caller.operation(2, Chain::new().apply("emit", vec![json!("first")]));
            // The callback still reports the request that registered it.
            expect![[r#"{"func":{"args":["first"],"ref":"on-data"},"id":1,"type":"CALLBACK"}"#]]
                .assert_eq(&caller.recv_compact().await);
            assert_eq!(caller.expect_success(2).await, json!(1));

            caller.operation(3, Chain::new().apply("emit", vec![json!("second")]));
            assert!(matches!(caller.recv().await, Outbound::Callback { .. }));
            assert_eq!(caller.expect_success(3).await, json!(1));

            caller.dispose("on-data");
            caller.operation(4, Chain::new().apply("emit", vec![json!("third")]));
            let (name, _) = caller.expect_error(4).await;
            assert_eq!(name, "CallbackDisposedError");
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn disposing_an_unknown_reference_is_harmless() {
    LocalSet::new()
        .run_until(async {
            let (_handle, mut caller) = bind(emitter());
            caller.dispose("never-registered");
            caller.assert_silent().await;

            caller.operation(1, Chain::new().apply("emit", vec![json!(0)]));
            assert_eq!(caller.expect_success(1).await, json!(0));
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn uncloneable_callback_arguments_fail_the_request() {
    LocalSet::new()
        .run_until(async {
            let (_handle, mut caller) = bind(iterating());
            caller.operation(1, Chain::new().apply("leak", vec![callback("cb", false)]));
            let (name, message) = caller.expect_error(1).await;
            assert_eq!(name, "DataCloneError");
            assert_eq!(message, "function could not be cloned");
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn nested_placeholders_stay_plain_data() {
    LocalSet::new()
        .run_until(async {
            let record = Record::new().with(
                "identity",
                Value::function(|args| Ok(args.into_iter().next().unwrap_or(Value::Undefined))),
            );
            let (_handle, mut caller) = bind(record);
            let nested = json!({ "inner": callback("cb", false) });
            caller.operation(1, Chain::new().apply("identity", vec![nested.clone()]));
            assert_eq!(caller.expect_success(1).await, nested);
        })
        .await;
}
