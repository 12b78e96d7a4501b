//! Serializer/deserializer capability for the keys and values of a topic.

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::message::Value;

/// A serializer/deserializer for the keys or the values of one topic.
///
/// There is no error channel: malformed input is the implementation's
/// responsibility, and the bundled serdes panic on payloads that do not match
/// the type they were configured for.
pub trait Serde: Send + Sync {
    fn serialize(&self, value: &Value) -> Bytes;
    fn deserialize(&self, bytes: &[u8]) -> Value;
}

/// Key and value serdes for one topic.
#[derive(Clone)]
pub struct TopicSerde {
    pub key_serde: Arc<dyn Serde>,
    pub value_serde: Arc<dyn Serde>,
}

/// Pass-through serde; payloads stay raw [Bytes].
pub struct BytesSerde;

impl Serde for BytesSerde {
    fn serialize(&self, value: &Value) -> Bytes {
        value
            .downcast_ref::<Bytes>()
            .expect("BytesSerde got a non-Bytes value")
            .clone()
    }

    fn deserialize(&self, bytes: &[u8]) -> Value {
        Box::new(Bytes::copy_from_slice(bytes))
    }
}

/// UTF-8 string serde. Invalid UTF-8 on the read path is replaced, not
/// rejected.
pub struct StringSerde;

impl Serde for StringSerde {
    fn serialize(&self, value: &Value) -> Bytes {
        let value = value
            .downcast_ref::<String>()
            .expect("StringSerde got a non-String value");
        Bytes::from(value.clone().into_bytes())
    }

    fn deserialize(&self, bytes: &[u8]) -> Value {
        Box::new(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// JSON serde backed by serde_json for any serializable type.
pub struct JsonSerde<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerde<T> {
    pub fn new() -> Self {
        JsonSerde {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSerde<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Serde for JsonSerde<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn serialize(&self, value: &Value) -> Bytes {
        let value = value
            .downcast_ref::<T>()
            .expect("JsonSerde got a value of an unexpected type");
        Bytes::from(serde_json::to_vec(value).expect("JSON serialization failed"))
    }

    fn deserialize(&self, bytes: &[u8]) -> Value {
        Box::new(serde_json::from_slice::<T>(bytes).expect("malformed JSON payload"))
    }
}
