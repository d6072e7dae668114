//! Payload codec registry.
//!
//! Maps a `payload_type` string to an encode/decode pair so that schema-less
//! stored payloads can be read back as typed values. The registry is an
//! explicit instance shared behind an `Arc`; each test builds its own.
//!
//! Registration is append-only: re-registering the same codec is a no-op,
//! registering a different one under a taken name is a [`LedgerError::CodecConflict`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::domain::Event;
use crate::error::{LedgerError, Result};

/// A payload shape bound to a stable `payload_type` name.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const PAYLOAD_TYPE: &'static str;
}

type EncodeFn = Arc<dyn Fn(&dyn Any) -> std::result::Result<Map<String, Value>, String> + Send + Sync>;
type DecodeFn =
    Arc<dyn Fn(&Map<String, Value>) -> std::result::Result<Box<dyn Any + Send>, String> + Send + Sync>;

/// An encode/decode pair for one Rust type.
///
/// Two codecs are the same codec when they target the same Rust type with
/// the same label and the same functions. Serde codecs have one identity
/// per type.
#[derive(Clone)]
pub struct Codec {
    type_id: TypeId,
    type_name: &'static str,
    label: String,
    /// Addresses of the user-supplied functions; `None` for serde codecs
    functions: Option<(usize, usize)>,
    encode: EncodeFn,
    decode: DecodeFn,
}

impl Codec {
    /// Serde-based codec: the payload is the JSON object form of `T`.
    pub fn serde<T>() -> Self
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        Self::build::<T>(
            "serde",
            None,
            |value: &T| match serde_json::to_value(value) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(other) => Err(format!("expected an object, got {}", other)),
                Err(e) => Err(e.to_string()),
            },
            |map: &Map<String, Value>| {
                serde_json::from_value(Value::Object(map.clone())).map_err(|e| e.to_string())
            },
        )
    }

    /// Codec from explicit functions.
    pub fn custom<T>(
        label: impl Into<String>,
        encode: fn(&T) -> std::result::Result<Map<String, Value>, String>,
        decode: fn(&Map<String, Value>) -> std::result::Result<T, String>,
    ) -> Self
    where
        T: Send + 'static,
    {
        let functions = Some((encode as usize, decode as usize));
        Self::build::<T>(label, functions, encode, decode)
    }

    fn build<T>(
        label: impl Into<String>,
        functions: Option<(usize, usize)>,
        encode: fn(&T) -> std::result::Result<Map<String, Value>, String>,
        decode: fn(&Map<String, Value>) -> std::result::Result<T, String>,
    ) -> Self
    where
        T: Send + 'static,
    {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            label: label.into(),
            functions,
            encode: Arc::new(move |any: &dyn Any| {
                let value = any
                    .downcast_ref::<T>()
                    .ok_or_else(|| "value does not match codec type".to_string())?;
                encode(value)
            }),
            decode: Arc::new(move |map: &Map<String, Value>| {
                decode(map).map(|v| Box::new(v) as Box<dyn Any + Send>)
            }),
        }
    }

    fn same_as(&self, other: &Codec) -> bool {
        self.type_id == other.type_id && self.label == other.label && self.functions == other.functions
    }

    fn describe(&self) -> String {
        format!("{} ({})", self.type_name, self.label)
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("type_name", &self.type_name)
            .field("label", &self.label)
            .finish()
    }
}

/// Process-lifetime mapping from payload type to codec.
#[derive(Debug, Default)]
pub struct PayloadRegistry {
    codecs: RwLock<HashMap<String, Codec>>,
}

impl PayloadRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry seeded with the runtime's own payload types.
    pub fn with_builtins() -> Result<Self> {
        let registry = Self::new();
        crate::runtime::register_payloads(&registry)?;
        Ok(registry)
    }

    /// Register the serde codec for `T` under `T::PAYLOAD_TYPE`.
    pub fn register<T: Payload>(&self) -> Result<()> {
        self.register_codec(T::PAYLOAD_TYPE, Codec::serde::<T>())
    }

    /// Register `codec` under `payload_type`.
    pub fn register_codec(&self, payload_type: &str, codec: Codec) -> Result<()> {
        let mut codecs = self.codecs.write();
        if let Some(existing) = codecs.get(payload_type) {
            if existing.same_as(&codec) {
                return Ok(());
            }
            return Err(LedgerError::CodecConflict {
                payload_type: payload_type.to_string(),
                existing: existing.describe(),
                attempted: codec.describe(),
            });
        }
        debug!(payload_type, codec = %codec.describe(), "Registered payload codec");
        codecs.insert(payload_type.to_string(), codec);
        Ok(())
    }

    pub fn is_registered(&self, payload_type: &str) -> bool {
        self.codecs.read().contains_key(payload_type)
    }

    /// Registered payload type names, sorted.
    pub fn payload_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.codecs.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Encode `value` with the codec registered for `T::PAYLOAD_TYPE`.
    pub fn encode<T: Payload>(&self, value: &T) -> Result<Value> {
        self.encode_as(T::PAYLOAD_TYPE, value)
    }

    /// Encode `value` with the codec registered under `payload_type`.
    pub fn encode_as<T: 'static>(&self, payload_type: &str, value: &T) -> Result<Value> {
        let codec = self.lookup(payload_type)?;
        if codec.type_id != TypeId::of::<T>() {
            return Err(LedgerError::SchemaMismatch {
                expected: codec.type_name.to_string(),
                actual: std::any::type_name::<T>().to_string(),
            });
        }
        (codec.encode)(value)
            .map(Value::Object)
            .map_err(|message| LedgerError::MalformedPayload {
                payload_type: payload_type.to_string(),
                message,
            })
    }

    /// Decode an event's payload as `T`, expecting `T::PAYLOAD_TYPE`.
    pub fn decode<T: Payload>(&self, event: &Event) -> Result<T> {
        self.decode_as(event, T::PAYLOAD_TYPE)
    }

    /// Decode an event's payload as `T`, expecting `expected` as its type.
    pub fn decode_as<T: 'static>(&self, event: &Event, expected: &str) -> Result<T> {
        if event.payload_type() != expected {
            return Err(LedgerError::SchemaMismatch {
                expected: expected.to_string(),
                actual: event.payload_type().to_string(),
            });
        }
        let codec = self.lookup(expected)?;
        if codec.type_id != TypeId::of::<T>() {
            return Err(LedgerError::SchemaMismatch {
                expected: codec.type_name.to_string(),
                actual: std::any::type_name::<T>().to_string(),
            });
        }
        let decoded = (codec.decode)(event.payload()).map_err(|message| {
            LedgerError::MalformedPayload {
                payload_type: expected.to_string(),
                message,
            }
        })?;
        decoded
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| LedgerError::SchemaMismatch {
                expected: codec.type_name.to_string(),
                actual: std::any::type_name::<T>().to_string(),
            })
    }

    fn lookup(&self, payload_type: &str) -> Result<Codec> {
        self.codecs
            .read()
            .get(payload_type)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownPayloadType {
                payload_type: payload_type.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventDraft, Namespace};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Foo {
        x: i64,
    }

    impl Payload for Foo {
        const PAYLOAD_TYPE: &'static str = "Foo";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct FooV2 {
        x: i64,
        y: i64,
    }

    fn event_with(payload_type: &str, payload: Value) -> Event {
        let draft = EventDraft::new("exp#1", Namespace::Statistic, "updated", "t001")
            .step_key("s1")
            .payload(payload_type, payload);
        Event::materialize(draft, 1)
    }

    #[test]
    fn test_same_codec_registers_idempotently() {
        let registry = PayloadRegistry::new();
        registry.register::<Foo>().unwrap();
        registry.register::<Foo>().unwrap();
        assert_eq!(registry.payload_types(), vec!["Foo".to_string()]);
    }

    #[test]
    fn test_different_codec_conflicts() {
        let registry = PayloadRegistry::new();
        registry.register::<Foo>().unwrap();

        let err = registry
            .register_codec("Foo", Codec::serde::<FooV2>())
            .unwrap_err();
        assert!(matches!(err, LedgerError::CodecConflict { .. }));
    }

    #[test]
    fn test_relabelled_codec_conflicts() {
        let registry = PayloadRegistry::new();
        registry.register::<Foo>().unwrap();

        let custom = Codec::custom::<Foo>(
            "x-only",
            |foo| {
                let mut map = Map::new();
                map.insert("x".to_string(), json!(foo.x));
                Ok(map)
            },
            |map| {
                map.get("x")
                    .and_then(Value::as_i64)
                    .map(|x| Foo { x })
                    .ok_or_else(|| "missing x".to_string())
            },
        );
        assert!(registry.register_codec("Foo", custom).is_err());
    }

    fn encode_x(foo: &Foo) -> std::result::Result<Map<String, Value>, String> {
        let mut map = Map::new();
        map.insert("x".to_string(), json!(foo.x));
        Ok(map)
    }

    fn decode_x(map: &Map<String, Value>) -> std::result::Result<Foo, String> {
        map.get("x")
            .and_then(Value::as_i64)
            .map(|x| Foo { x })
            .ok_or_else(|| "missing x".to_string())
    }

    fn encode_value(foo: &Foo) -> std::result::Result<Map<String, Value>, String> {
        let mut map = Map::new();
        map.insert("value".to_string(), json!(foo.x));
        Ok(map)
    }

    fn decode_value(map: &Map<String, Value>) -> std::result::Result<Foo, String> {
        map.get("value")
            .and_then(Value::as_i64)
            .map(|x| Foo { x })
            .ok_or_else(|| "missing value".to_string())
    }

    #[test]
    fn test_same_label_different_functions_conflicts() {
        let registry = PayloadRegistry::new();
        registry
            .register_codec("Foo", Codec::custom::<Foo>("v1", encode_x, decode_x))
            .unwrap();

        // Same functions again is a no-op
        registry
            .register_codec("Foo", Codec::custom::<Foo>("v1", encode_x, decode_x))
            .unwrap();

        let err = registry
            .register_codec("Foo", Codec::custom::<Foo>("v1", encode_value, decode_value))
            .unwrap_err();
        assert!(matches!(err, LedgerError::CodecConflict { .. }));

        // Swapping only one half is drift too
        let err = registry
            .register_codec("Foo", Codec::custom::<Foo>("v1", encode_x, decode_value))
            .unwrap_err();
        assert!(matches!(err, LedgerError::CodecConflict { .. }));
    }

    #[test]
    fn test_decode_unregistered_type() {
        let registry = PayloadRegistry::new();
        let event = event_with("Foo", json!({"x": 1}));

        let err = registry.decode::<Foo>(&event).unwrap_err();
        assert!(matches!(err, LedgerError::UnknownPayloadType { .. }));
    }

    #[test]
    fn test_decode_wrong_payload_type() {
        let registry = PayloadRegistry::new();
        registry.register::<Foo>().unwrap();
        let event = event_with("Bar", json!({"x": 1}));

        let err = registry.decode::<Foo>(&event).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::SchemaMismatch { ref expected, ref actual }
                if expected == "Foo" && actual == "Bar"
        ));
    }

    #[test]
    fn test_decode_into_wrong_rust_type() {
        let registry = PayloadRegistry::new();
        registry.register::<Foo>().unwrap();
        let event = event_with("Foo", json!({"x": 1, "y": 2}));

        let err = registry.decode_as::<FooV2>(&event, "Foo").unwrap_err();
        assert!(matches!(err, LedgerError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_decode_malformed_content() {
        let registry = PayloadRegistry::new();
        registry.register::<Foo>().unwrap();
        let event = event_with("Foo", json!({"x": "not a number"}));

        let err = registry.decode::<Foo>(&event).unwrap_err();
        assert!(matches!(err, LedgerError::MalformedPayload { .. }));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let registry = PayloadRegistry::new();
        registry.register::<Foo>().unwrap();

        let value = Foo { x: 42 };
        let encoded = registry.encode(&value).unwrap();
        let event = event_with(Foo::PAYLOAD_TYPE, encoded);

        assert_eq!(registry.decode::<Foo>(&event).unwrap(), value);
    }

    #[test]
    fn test_encode_requires_registration() {
        let registry = PayloadRegistry::new();
        let err = registry.encode(&Foo { x: 1 }).unwrap_err();
        assert!(matches!(err, LedgerError::UnknownPayloadType { .. }));
    }
}
