//! Property tests for the scripting sandbox
//!
//! An identity transform must hand back payload and metadata exactly as it
//! received them, whatever their shape.

use proptest::prelude::*;
use radapter::config::SandboxSettings;
use radapter::message::{into_payload, Metadata};
use radapter::scripting::{builtins, CancelToken, Outcome};
use radapter::{BindingId, Message, Scalar, ScriptEngine};
use serde_json::{Map, Value};

fn finite_float() -> impl Strategy<Value = f64> {
    any::<f64>().prop_filter("JSON numbers are finite", |f| f.is_finite())
}

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        any::<u64>().prop_map(Value::from),
        finite_float().prop_map(Value::from),
        "[a-zA-Z0-9 _:-]{0,16}".prop_map(Value::String),
    ]
}

fn json_value() -> impl Strategy<Value = Value> {
    leaf().prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::btree_map("[a-z_]{1,8}", inner, 0..6)
                .prop_map(|m| Value::Object(m.into_iter().collect::<Map<String, Value>>())),
        ]
    })
}

fn payload() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-z_]{1,8}", json_value(), 0..8)
        .prop_map(|m| Value::Object(m.into_iter().collect()))
}

fn scalar() -> impl Strategy<Value = Scalar> {
    prop_oneof![
        any::<bool>().prop_map(Scalar::Bool),
        any::<i64>().prop_map(Scalar::Int),
        finite_float().prop_map(Scalar::Float),
        "[a-z0-9]{0,12}".prop_map(Scalar::Text),
    ]
}

fn metadata() -> impl Strategy<Value = Metadata> {
    prop::collection::btree_map("[a-z_]{1,8}", scalar(), 0..5)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn identity_transform_preserves_message(payload in payload(), metadata in metadata()) {
        let engine = ScriptEngine::new(&SandboxSettings::default());
        let script = engine.compile("identity", builtins::IDENTITY).unwrap();
        let instance = engine.instantiate(script);
        let input = Message::new(BindingId::new("src"), into_payload(payload))
            .with_metadata(metadata);

        let outcome = engine.invoke(&instance, &input, &CancelToken::new()).unwrap();
        let Outcome::Emit(output) = outcome else {
            panic!("identity dropped the message");
        };
        prop_assert_eq!(output.payload(), input.payload());
        prop_assert_eq!(output.metadata(), input.metadata());
        prop_assert_eq!(output.source(), input.source());
        prop_assert_eq!(output.timestamp(), input.timestamp());
        prop_assert_eq!(
            serde_json::to_string(output.payload()).unwrap(),
            serde_json::to_string(input.payload()).unwrap()
        );
    }

    #[test]
    fn wide_integers_survive_identity(n in (i64::MAX as u64 + 1)..=u64::MAX) {
        let engine = ScriptEngine::new(&SandboxSettings::default());
        let instance = engine.instantiate(engine.compile("identity", builtins::IDENTITY).unwrap());
        let input = Message::from_value(BindingId::new("src"), serde_json::json!({ "n": n }));
        let Outcome::Emit(output) = engine.invoke(&instance, &input, &CancelToken::new()).unwrap() else {
            panic!("identity dropped the message");
        };
        prop_assert_eq!(output.payload()["n"].as_u64(), Some(n));
    }
}
