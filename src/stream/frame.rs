//! Inbound frame envelope

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Envelope of every frame received from the event source
///
/// `data` is itself an encoded payload whose schema belongs to the event type;
/// decoding it is left to the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFrame {
    pub event: String,
    pub data: String,
}

impl StreamFrame {
    /// Decode a raw text frame into the envelope
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Decode the inner payload as `T`
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_envelope() {
        let frame = StreamFrame::parse(r#"{"event":"receipt","data":"{\"a\":1}"}"#).unwrap();
        assert_eq!(frame.event, "receipt");

        let inner: serde_json::Value = frame.decode_data().unwrap();
        assert_eq!(inner["a"], 1);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(StreamFrame::parse("not json").is_err());
        assert!(StreamFrame::parse(r#"{"event":"receipt"}"#).is_err());
        // data must be an encoded string, not an inline object
        assert!(StreamFrame::parse(r#"{"event":"receipt","data":{"a":1}}"#).is_err());
    }
}
