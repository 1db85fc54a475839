use std::marker::PhantomData;

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;

/// Turns raw payload bytes into a typed key or value.
pub trait Deserializer<T>: Send + Sync {
    fn deserialize(&self, topic: &str, payload: &[u8]) -> Result<T>;
}

/// Builds deserializer instances for a runner. Construction may fail (bad
/// schema registry config and the like) and is fatal at start.
pub trait DeserializerFactory<T>: Send + Sync {
    fn create(&self) -> Result<Box<dyn Deserializer<T>>>;
}

/// serde_json payload decoding.
pub struct JsonDeserializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDeserializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonDeserializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Deserializer<T> for JsonDeserializer<T> {
    fn deserialize(&self, topic: &str, payload: &[u8]) -> Result<T> {
        serde_json::from_slice(payload)
            .with_context(|| format!("failed to decode JSON payload from topic {topic}"))
    }
}

pub struct JsonDeserializerFactory<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDeserializerFactory<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonDeserializerFactory<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned + 'static> DeserializerFactory<T> for JsonDeserializerFactory<T> {
    fn create(&self) -> Result<Box<dyn Deserializer<T>>> {
        Ok(Box::new(JsonDeserializer::new()))
    }
}

/// UTF-8 string payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringDeserializer;

impl Deserializer<String> for StringDeserializer {
    fn deserialize(&self, topic: &str, payload: &[u8]) -> Result<String> {
        std::str::from_utf8(payload)
            .map(str::to_owned)
            .map_err(|e| anyhow!("non-utf8 payload from topic {topic}: {e}"))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StringDeserializerFactory;

impl DeserializerFactory<String> for StringDeserializerFactory {
    fn create(&self) -> Result<Box<dyn Deserializer<String>>> {
        Ok(Box::new(StringDeserializer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Payload {
        id: u64,
        name: String,
    }

    #[test]
    fn json_round_trip() {
        let deserializer = JsonDeserializerFactory::<Payload>::new().create().unwrap();
        let decoded = deserializer
            .deserialize("events", br#"{"id": 7, "name": "seven"}"#)
            .unwrap();
        assert_eq!(
            decoded,
            Payload {
                id: 7,
                name: "seven".to_string()
            }
        );
    }

    #[test]
    fn json_decode_failure_names_topic() {
        let deserializer = JsonDeserializerFactory::<Payload>::new().create().unwrap();
        let err = deserializer
            .deserialize("events", b"not json")
            .unwrap_err()
            .to_string();
        assert!(err.contains("events"), "unexpected error: {err}");
    }

    #[test]
    fn string_decoding() {
        let deserializer = StringDeserializerFactory.create().unwrap();
        assert_eq!(
            deserializer.deserialize("events", b"hello").unwrap(),
            "hello"
        );
        assert!(deserializer
            .deserialize("events", &[0xff, 0xfe])
            .is_err());
    }
}
