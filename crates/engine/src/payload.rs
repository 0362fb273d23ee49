//! Opaque channel payloads and the codec registry.
//!
//! A payload is a tagged JSON value. The payload type of a channel is fixed
//! at creation; the engine only needs `Clone`, `Merge`, and
//! `Marshal`/`Unmarshal`, all of which dispatch through [`PayloadCodec`] on
//! the type tag. Per-tag merge functions can be registered as a fast path
//! for hot payload types; everything else falls back to the generic value
//! merge.

use crate::error::{EngineError, Result};
use crate::merge::{merge_values, MergeOptions};
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Arc;

/// A custom merge routine registered for one payload type.
pub type MergeFn = fn(&mut Value, &Value, &MergeOptions);

/// A structured message with a type tag.
///
/// The tag plays the role of a fully-qualified message name; two payloads
/// merge only when their tags match.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    type_tag: Arc<str>,
    value: Value,
}

impl Payload {
    pub fn new(type_tag: impl Into<Arc<str>>, value: Value) -> Self {
        Self {
            type_tag: type_tag.into(),
            value,
        }
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    /// Serialize the payload value to bytes.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.value)?)
    }
}

#[derive(Default)]
struct CodecEntry {
    prototype: Option<Value>,
    merge: Option<MergeFn>,
}

/// Registry mapping type tags to payload factories and merge fast paths.
///
/// Registration is optional: an unregistered tag behaves as a plain JSON
/// message whose empty form is `{}`.
#[derive(Default)]
pub struct PayloadCodec {
    types: DashMap<String, CodecEntry>,
}

impl PayloadCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the empty form of a payload type.
    pub fn register(&self, type_tag: impl Into<String>, prototype: Value) {
        self.types.entry(type_tag.into()).or_default().prototype = Some(prototype);
    }

    /// Register a custom merge routine for a payload type. It takes
    /// precedence over the generic value merge.
    pub fn register_merge(&self, type_tag: impl Into<String>, merge: MergeFn) {
        self.types.entry(type_tag.into()).or_default().merge = Some(merge);
    }

    /// A new empty payload of the given type.
    pub fn new_empty(&self, type_tag: &str) -> Payload {
        let value = self
            .types
            .get(type_tag)
            .and_then(|entry| entry.prototype.clone())
            .unwrap_or_else(|| Value::Object(Map::new()));
        Payload::new(type_tag.to_string(), value)
    }

    /// Deserialize bytes into a payload of the given type.
    pub fn unmarshal(&self, type_tag: &str, bytes: &[u8]) -> Result<Payload> {
        let value: Value = serde_json::from_slice(bytes)?;
        Ok(Payload::new(type_tag.to_string(), value))
    }

    /// Merge `src` into `dst` under `options`.
    ///
    /// Fails with `TypeMismatch` before touching `dst` when the tags differ.
    pub fn merge(&self, dst: &mut Payload, src: &Payload, options: &MergeOptions) -> Result<()> {
        if dst.type_tag != src.type_tag {
            return Err(EngineError::TypeMismatch {
                expected: dst.type_tag.to_string(),
                actual: src.type_tag.to_string(),
            });
        }
        let custom = self
            .types
            .get(dst.type_tag())
            .and_then(|entry| entry.merge);
        match custom {
            Some(merge) => merge(&mut dst.value, &src.value, options),
            None => merge_values(&mut dst.value, &src.value, options),
        }
        Ok(())
    }
}
