//! Wire shapes handed to the compute target.
//!
//! An unbatched binding invokes the target once per message with a single
//! [`MessagePayload`]; a batched binding invokes it once per batch with a
//! JSON array of them. Message bytes travel base64-encoded.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::invoke::InvokeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub subject: String,
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
    /// Delivery attempt count for this message, 1 on first delivery.
    pub delivered: u64,
    pub published: DateTime<Utc>,
}

pub fn encode_single(payload: &MessagePayload) -> Result<Vec<u8>, InvokeError> {
    serde_json::to_vec(payload).map_err(InvokeError::Marshal)
}

pub fn encode_batch(payloads: &[MessagePayload]) -> Result<Vec<u8>, InvokeError> {
    serde_json::to_vec(payloads).map_err(InvokeError::Marshal)
}

mod base64_bytes {
    use base64::prelude::{Engine, BASE64_STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> MessagePayload {
        MessagePayload {
            subject: "orders.created".to_owned(),
            headers: HashMap::from([(
                "Content-Type".to_owned(),
                vec!["application/json".to_owned()],
            )]),
            data: br#"{"order":42}"#.to_vec(),
            stream_sequence: 17,
            consumer_sequence: 9,
            delivered: 1,
            published: Utc::now(),
        }
    }

    #[test]
    fn data_is_base64_on_the_wire() {
        let encoded = encode_single(&payload()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value["data"], "eyJvcmRlciI6NDJ9");
        assert_eq!(value["subject"], "orders.created");
    }

    #[test]
    fn batch_encodes_as_array() {
        let batch = vec![payload(), payload()];
        let encoded = encode_batch(&batch).unwrap();
        let decoded: Vec<MessagePayload> = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, batch);
    }
}
