use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Envelope is the universal wire record. `data` is schema-free at this
/// layer; each service deserializes it into a typed record at its dispatch
/// boundary. Unknown fields are ignored, missing ones default to empty.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub service: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub clock: u64,
}

impl Envelope {
    /// Build an envelope stamped with the current wall-clock time. `clock`
    /// must come from a fresh `LamportClock::tick()`.
    pub fn new(service: impl Into<String>, data: Map<String, Value>, clock: u64) -> Self {
        Envelope {
            service: service.into(),
            data,
            timestamp: Utc::now().to_rfc3339(),
            clock,
        }
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Convenience for building `data` maps from `serde_json::json!` literals.
/// Non-object values collapse to an empty map.
pub fn envelope_data(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("CBOR encode failure: {0}")]
    Cbor(#[from] ciborium::ser::Error<std::io::Error>),
}

#[derive(Debug, thiserror::Error)]
#[error("not a valid envelope (CBOR: {cbor}; JSON: {json})")]
pub struct DecodeError {
    cbor: ciborium::de::Error<std::io::Error>,
    json: serde_json::Error,
}

/// Canonical encoding. Everything this fleet emits is CBOR.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(envelope, &mut out)?;
    Ok(out)
}

/// The single compatibility boundary: decoders accept the JSON rendering of
/// the same shape, because older clients historically sent either.
pub fn decode(raw: &[u8]) -> Result<Envelope, DecodeError> {
    match ciborium::de::from_reader(raw) {
        Ok(envelope) => Ok(envelope),
        Err(cbor) => match serde_json::from_slice(raw) {
            Ok(envelope) => Ok(envelope),
            Err(json) => Err(DecodeError { cbor, json }),
        },
    }
}
