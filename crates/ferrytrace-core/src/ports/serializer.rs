//! Payload serializer port
//!
//! Batches are serialized through [`IPayloadSerializer`]; the byte layout is
//! opaque to the queue and the scheduler.

use serde::Serialize;

/// Port for turning a payload value into bytes
pub trait IPayloadSerializer<T: ?Sized>: Send + Sync {
    fn serialize(&self, value: &T) -> anyhow::Result<Vec<u8>>;
}

/// serde_json serializer
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl<T: Serialize + ?Sized> IPayloadSerializer<T> for JsonSerializer {
    fn serialize(&self, value: &T) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn test_json_serializer() {
        let mut value = BTreeMap::new();
        value.insert("dropped_events", 3);
        let bytes = JsonSerializer.serialize(&value).unwrap();
        assert_eq!(bytes, br#"{"dropped_events":3}"#);
    }
}
