use std::fmt::Write;

use serde_json::{Map, Value};
use sha1::{Digest, Sha1};

use crate::types::EvaluationContext;

/// Reduces an evaluation context to a short string. Equal contexts must
/// produce equal fingerprints.
pub trait ContextFingerprinter: Send + Sync {
    fn fingerprint(&self, context: &EvaluationContext) -> String;
}

/// SHA-1 hex digest of the context serialized as JSON with every object's
/// keys sorted, so attribute insertion order does not matter.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha1Fingerprinter;

impl ContextFingerprinter for Sha1Fingerprinter {
    fn fingerprint(&self, context: &EvaluationContext) -> String {
        let mut document = Map::new();
        if let Some(targeting_key) = &context.targeting_key {
            document.insert(
                "targetingKey".to_owned(),
                Value::String(targeting_key.clone()),
            );
        }
        document.insert(
            "attributes".to_owned(),
            Value::Object(context.attributes.clone()),
        );

        let canonical = canonicalize(Value::Object(document)).to_string();
        let digest = Sha1::digest(canonical.as_bytes());

        digest.iter().fold(String::new(), |mut acc, byte| {
            let _ = write!(acc, "{:02x}", byte);
            acc
        })
    }
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, canonicalize(value)))
                    .collect(),
            )
        }
        Value::Array(values) => Value::Array(values.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
