//! Message envelope
//!
//! `Message` pairs a topic with a JSON payload. The engine never looks inside
//! the payload beyond checking that it is one well-formed JSON value: WebSocket
//! subscribers receive it verbatim, embedded in an outbound frame.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::RawValue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
}

/// Outbound WebSocket frame: `{"topic": ..., "payload": <raw json>}`.
#[derive(Serialize)]
struct OutboundFrame<'a> {
    topic: &'a str,
    payload: &'a RawValue,
}

impl Message {
    /// Creates a message whose payload is the JSON encoding of `value`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use fanout::broker::Message;
    ///
    /// let msg = Message::new("sensor_updates", &serde_json::json!({"temp": 25})).unwrap();
    /// assert_eq!(&msg.payload[..], br#"{"temp":25}"#);
    /// ```
    pub fn new<T>(topic: impl Into<String>, value: &T) -> Result<Self, serde_json::Error>
    where
        T: Serialize + ?Sized,
    {
        Ok(Self {
            topic: topic.into(),
            payload: Bytes::from(serde_json::to_vec(value)?),
        })
    }

    /// Wraps an already encoded payload without validating it.
    pub fn from_raw(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// True when the payload is exactly one well-formed JSON value, UTF-8
    /// strings included. Anything accepted here can be embedded by
    /// [`Message::to_frame`].
    pub fn is_valid(&self) -> bool {
        serde_json::from_slice::<&RawValue>(&self.payload).is_ok()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Serializes the message as a WebSocket text frame, embedding the payload
    /// verbatim. Fails if the payload is not valid JSON.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        let payload: &RawValue = serde_json::from_slice(&self.payload)?;
        serde_json::to_string(&OutboundFrame {
            topic: &self.topic,
            payload,
        })
    }
}
