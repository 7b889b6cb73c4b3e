use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of action an envelope asks the hub to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgType {
    Subscribe,
    Unsubscribe,
    Publish,
}

impl MsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Subscribe => "subscribe",
            MsgType::Unsubscribe => "unsubscribe",
            MsgType::Publish => "publish",
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a `msg_type` string is not one of the known kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMsgType(pub String);

impl FromStr for MsgType {
    type Err = UnknownMsgType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscribe" => Ok(MsgType::Subscribe),
            "unsubscribe" => Ok(MsgType::Unsubscribe),
            "publish" => Ok(MsgType::Publish),
            other => Err(UnknownMsgType(other.to_string())),
        }
    }
}

/// The unit exchanged on the wire.
///
/// `data` is an opaque JSON document; the hub never looks inside it. A JSON
/// `null` is indistinguishable from an absent payload and is carried as `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub client_id: String,
    pub msg_id: String,
    pub msg_type: MsgType,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn new(client_id: impl Into<String>, msg_type: MsgType, topic: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            msg_id: Uuid::new_v4().to_string(),
            msg_type,
            topic: topic.into(),
            data: None,
        }
    }

    pub fn subscribe(client_id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self::new(client_id, MsgType::Subscribe, topic)
    }

    pub fn unsubscribe(client_id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self::new(client_id, MsgType::Unsubscribe, topic)
    }

    pub fn publish(
        client_id: impl Into<String>,
        topic: impl Into<String>,
        data: impl Into<Value>,
    ) -> Self {
        let mut envelope = Self::new(client_id, MsgType::Publish, topic);
        envelope.data = Some(data.into()).filter(|value| !value.is_null());
        envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_type_from_str() {
        assert_eq!("subscribe".parse::<MsgType>(), Ok(MsgType::Subscribe));
        assert_eq!("unsubscribe".parse::<MsgType>(), Ok(MsgType::Unsubscribe));
        assert_eq!("publish".parse::<MsgType>(), Ok(MsgType::Publish));
        assert_eq!(
            "Publish".parse::<MsgType>(),
            Err(UnknownMsgType("Publish".to_string()))
        );
    }

    #[test]
    fn test_constructors_generate_unique_msg_ids() {
        let a = Envelope::subscribe("c1", "news");
        let b = Envelope::subscribe("c1", "news");
        assert_ne!(a.msg_id, b.msg_id);
        assert_eq!(a.msg_type, MsgType::Subscribe);
        assert!(a.data.is_none());
    }

    #[test]
    fn test_publish_drops_null_payload() {
        let envelope = Envelope::publish("c1", "news", Value::Null);
        assert!(envelope.data.is_none());

        let envelope = Envelope::publish("c1", "news", "hello");
        assert_eq!(envelope.data, Some(Value::String("hello".to_string())));
    }
}
