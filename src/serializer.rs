//! Event serializers.
//!
//! A serializer turns an entity into an opaque persisted representation and
//! back. Decoding may legitimately yield nothing: some event kinds are only
//! ever written, never read back.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Result;

pub trait Serializer<E>: Send + Sync {
    fn encode(&self, entity: &E) -> Result<Value>;

    /// `Ok(None)` means decoding is intentionally unsupported.
    fn decode(&self, repr: &Value) -> Result<Option<E>>;
}

/// Full JSON round trip through serde.
pub struct JsonSerializer<E> {
    _marker: PhantomData<fn() -> E>,
}

impl<E> JsonSerializer<E> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<E> Default for JsonSerializer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for JsonSerializer<E> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for JsonSerializer<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JsonSerializer")
    }
}

impl<E: Serialize + DeserializeOwned> Serializer<E> for JsonSerializer<E> {
    fn encode(&self, entity: &E) -> Result<Value> {
        Ok(serde_json::to_value(entity)?)
    }

    fn decode(&self, repr: &Value) -> Result<Option<E>> {
        Ok(Some(serde_json::from_value(repr.clone())?))
    }
}

/// Write-only serializer: encodes with serde, never decodes.
pub struct EncodeOnly<E> {
    _marker: PhantomData<fn() -> E>,
}

impl<E> EncodeOnly<E> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<E> Default for EncodeOnly<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EncodeOnly<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncodeOnly")
    }
}

impl<E: Serialize> Serializer<E> for EncodeOnly<E> {
    fn encode(&self, entity: &E) -> Result<Value> {
        Ok(serde_json::to_value(entity)?)
    }

    fn decode(&self, _repr: &Value) -> Result<Option<E>> {
        Ok(None)
    }
}
