//! Payload Registry Integration Tests
//!
//! Tests codec registration and typed reads of ledger events through the
//! reader.

use std::sync::Arc;

use earlysign::core::{Codec, Ledger, MemoryStore, Payload, PayloadRegistry};
use earlysign::domain::{EventDraft, EventFilter, Namespace};
use earlysign::error::{ErrorKind, LedgerError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Foo {
    count: u64,
}

impl Payload for Foo {
    const PAYLOAD_TYPE: &'static str = "Foo";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Bar {
    label: String,
}

impl Payload for Bar {
    const PAYLOAD_TYPE: &'static str = "Bar";
}

fn foo_draft(payload: serde_json::Value) -> EventDraft {
    EventDraft::new("exp#1", Namespace::Observation, "observation", "t001")
        .step_key("obs:t001")
        .payload("Foo", payload)
}

fn ledger_with(registry: PayloadRegistry) -> Ledger {
    Ledger::new(Arc::new(MemoryStore::new()), Arc::new(registry))
}

#[test]
fn test_register_same_codec_twice_is_a_no_op() {
    let registry = PayloadRegistry::new();
    registry.register::<Foo>().unwrap();
    registry.register::<Foo>().unwrap();
    assert_eq!(registry.payload_types(), vec!["Foo"]);
}

#[test]
fn test_register_different_codec_conflicts() {
    let registry = PayloadRegistry::new();
    registry.register::<Foo>().unwrap();

    let err = registry.register_codec("Foo", Codec::serde::<Bar>()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CodecConflict);

    // Same type, different codec implementation
    let custom = Codec::custom::<Foo>(
        "counter",
        |foo: &Foo| {
            let mut map = Map::new();
            map.insert("n".to_string(), Value::from(foo.count));
            Ok(map)
        },
        |map: &Map<String, Value>| {
            map.get("n")
                .and_then(Value::as_u64)
                .map(|count| Foo { count })
                .ok_or_else(|| "missing n".to_string())
        },
    );
    let err = registry.register_codec("Foo", custom).unwrap_err();
    assert!(matches!(err, LedgerError::CodecConflict { .. }));

    // The first registration is kept
    assert!(registry.is_registered("Foo"));
}

#[tokio::test]
async fn test_custom_codec_round_trips_through_ledger() {
    let registry = PayloadRegistry::new();
    registry
        .register_codec(
            "Foo",
            Codec::custom::<Foo>(
                "counter",
                |foo: &Foo| {
                    let mut map = Map::new();
                    map.insert("n".to_string(), Value::from(foo.count));
                    Ok(map)
                },
                |map: &Map<String, Value>| {
                    map.get("n")
                        .and_then(Value::as_u64)
                        .map(|count| Foo { count })
                        .ok_or_else(|| "missing n".to_string())
                },
            ),
        )
        .unwrap();
    let ledger = ledger_with(registry);

    let draft = EventDraft::new("exp#1", Namespace::Observation, "observation", "t001").step_key("obs:t001");
    let event = ledger.append_typed(draft, &Foo { count: 7 }).await.unwrap();

    assert_eq!(event.payload_type(), "Foo");
    assert_eq!(event.payload().get("n"), Some(&json!(7)));
    let decoded: Foo = ledger.reader().decode(&event).unwrap();
    assert_eq!(decoded, Foo { count: 7 });
}

#[tokio::test]
async fn test_untyped_append_needs_no_codec() {
    let ledger = ledger_with(PayloadRegistry::new());
    let event = ledger.append(foo_draft(json!({ "count": 3 }))).await.unwrap();

    let err = ledger.reader().decode::<Foo>(&event).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownPayloadType);

    // Raw reads still work
    let latest = ledger.reader().latest(&EventFilter::entity("exp#1")).await.unwrap().unwrap();
    assert_eq!(latest.payload().get("count"), Some(&json!(3)));
}

#[tokio::test]
async fn test_decode_errors_are_classified() {
    let registry = PayloadRegistry::new();
    registry.register::<Foo>().unwrap();
    registry.register::<Bar>().unwrap();
    let ledger = ledger_with(registry);
    let reader = ledger.reader();

    let good = ledger.append(foo_draft(json!({ "count": 3 }))).await.unwrap();
    let bad = ledger.append(foo_draft(json!({ "count": "three" }))).await.unwrap();

    assert_eq!(reader.decode::<Foo>(&good).unwrap(), Foo { count: 3 });
    assert_eq!(reader.decode::<Bar>(&good).unwrap_err().kind(), ErrorKind::SchemaMismatch);
    assert_eq!(reader.decode::<Foo>(&bad).unwrap_err().kind(), ErrorKind::MalformedPayload);
}

#[tokio::test]
async fn test_latest_decoded_uses_last_matching_event() {
    let registry = PayloadRegistry::new();
    registry.register::<Foo>().unwrap();
    let ledger = ledger_with(registry);

    for (t, count) in [("t002", 2), ("t001", 1), ("t003", 3)] {
        let draft = EventDraft::new("exp#1", Namespace::Observation, "observation", t).step_key(format!("obs:{}", t));
        ledger.append_typed(draft, &Foo { count }).await.unwrap();
    }

    let latest: Option<Foo> = ledger
        .reader()
        .latest_decoded(&EventFilter::entity("exp#1").payload_type("Foo"))
        .await
        .unwrap();
    assert_eq!(latest, Some(Foo { count: 3 }));

    let none: Option<Foo> = ledger
        .reader()
        .latest_decoded(&EventFilter::entity("exp#2"))
        .await
        .unwrap();
    assert!(none.is_none());
}
