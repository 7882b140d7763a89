//! Bus message value
//!
//! A [`Message`] is what modules exchange. Its address (house, sender,
//! recipient, command, args) travels in the topic, see [`crate::topic`];
//! its data travels in the payload as a JSON object `{"data": ...}`.
//! A message without data is sent as a single null byte.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{Error, Result};
use crate::topic::TopicParts;

/// The module distributing configuration
pub const CONFIG_AUTHORITY: &str = "controller/config";

/// Recipient meaning "every module"
pub const BROADCAST: &str = "*/*";

/// Payload of a message without data
pub const NULL_PAYLOAD: [u8; 1] = [0];

/// Commands handled by the bus client itself
pub mod commands {
    /// Configuration delivery from the config authority
    pub const CONF: &str = "CONF";
    /// Liveness check
    pub const PING: &str = "PING";
    /// Liveness answer
    pub const PONG: &str = "PONG";
    /// Configuration request to the config authority
    pub const SUBSCRIBE: &str = "SUBSCRIBE";
    /// Configuration request acknowledgment
    pub const SUBSCRIBE_ACK: &str = "SUBSCRIBE_ACK";
    /// Module started (`1`) or stopped (`0`)
    pub const STATUS: &str = "STATUS";
    /// Module manifest broadcast
    pub const MANIFEST: &str = "MANIFEST";
    /// Manifest request
    pub const REQ_MANIFEST: &str = "REQ_MANIFEST";
    /// Configuration removal
    pub const DELETE: &str = "DELETE";
    /// Configuration save
    pub const SAVE: &str = "SAVE";
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    data: &'a Value,
}

/// A missing or `null` data key decodes as a null message
#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Option<Value>,
}

/// A bus message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// House the message belongs to
    pub house_id: String,
    /// Sending module (`scope/name`)
    pub sender: String,
    /// Receiving module (`scope/name` or [`BROADCAST`])
    pub recipient: String,
    /// Command
    pub command: String,
    /// Command arguments, may contain `/`
    pub args: String,
    /// Configuration schema version, prefixed to args on the wire
    pub config_schema: Option<u32>,
    /// Whether the broker should retain the message
    pub retain: bool,
    /// Topic the message arrived on (empty for outbound messages)
    pub topic: String,
    data: Option<Value>,
}

impl Message {
    /// Create an empty message from `sender` in `house_id`
    pub fn new(house_id: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            house_id: house_id.into(),
            sender: sender.into(),
            recipient: String::new(),
            command: String::new(),
            args: String::new(),
            config_schema: None,
            retain: false,
            topic: String::new(),
            data: None,
        }
    }

    /// Set the recipient
    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = recipient.into();
        self
    }

    /// Set the command
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// Set the args
    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = args.into();
        self
    }

    /// Set the data
    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.set_data(data);
        self
    }

    /// Set the configuration schema version
    pub fn with_config_schema(mut self, schema: u32) -> Self {
        self.config_schema = Some(schema);
        self
    }

    /// Ask the broker to retain the message
    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }

    /// Replace the data
    pub fn set_data(&mut self, data: impl Into<Value>) {
        self.data = Some(data.into());
    }

    /// The data, `None` for a null message
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// The data when it is a string
    pub fn data_str(&self) -> Option<&str> {
        self.data.as_ref().and_then(Value::as_str)
    }

    /// Whether the message carries no data
    pub fn is_null(&self) -> bool {
        self.data.is_none()
    }

    /// Args as written on the wire, including the schema prefix
    pub fn wire_args(&self) -> String {
        match self.config_schema {
            Some(schema) if self.args.is_empty() => schema.to_string(),
            Some(schema) => format!("{}/{}", schema, self.args),
            None => self.args.clone(),
        }
    }

    /// Encode the payload
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        match &self.data {
            Some(data) => Ok(serde_json::to_vec(&EnvelopeRef { data })?),
            None => Ok(NULL_PAYLOAD.to_vec()),
        }
    }

    /// Build an answer addressed back to the sender of this message
    ///
    /// House, command, args and data are kept; the caller usually changes
    /// the command.
    pub fn reply(&self, sender: impl Into<String>) -> Message {
        Message {
            house_id: self.house_id.clone(),
            sender: sender.into(),
            recipient: self.sender.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            config_schema: self.config_schema,
            retain: false,
            topic: String::new(),
            data: self.data.clone(),
        }
    }

    /// Parse an inbound message
    ///
    /// # Parameters
    ///
    /// - `topic`: Topic the message arrived on
    /// - `payload`: Raw payload bytes
    /// - `retained`: Whether the broker delivered a retained copy
    /// - `version`: Protocol version the client speaks
    pub fn parse(topic: &str, payload: &[u8], retained: bool, version: u32) -> Result<Self> {
        let parts = TopicParts::parse(topic)?;
        if parts.version != version {
            return Err(Error::invalid_message(format!(
                "protocol v{} message received by a v{} client",
                parts.version, version
            )));
        }

        let data = if payload.is_empty() || payload == NULL_PAYLOAD {
            None
        } else {
            let envelope: Envelope = serde_json::from_slice(payload)
                .map_err(|e| Error::invalid_message(format!("undecodable payload: {}", e)))?;
            envelope.data
        };

        let (config_schema, args) =
            if parts.sender == CONFIG_AUTHORITY || parts.recipient == CONFIG_AUTHORITY {
                split_config_schema(parts.args)
            } else {
                (None, parts.args)
            };

        Ok(Self {
            house_id: parts.house_id,
            sender: parts.sender,
            recipient: parts.recipient,
            command: parts.command,
            args,
            config_schema,
            retain: retained,
            topic: topic.to_string(),
            data,
        })
    }
}

/// `1/sensors/kitchen` carries schema 1 for `sensors/kitchen`
fn split_config_schema(args: String) -> (Option<u32>, String) {
    if let Some((first, rest)) = args.split_once('/')
        && let Ok(schema) = first.parse::<u32>()
    {
        return (Some(schema), rest.to_string());
    }
    (None, args)
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} -> {} {} [{}]",
            self.house_id,
            self.sender,
            self.recipient,
            self.command,
            self.wire_args()
        )?;
        match &self.data {
            Some(data) => write!(f, " {}", data),
            None => write!(f, " <null>"),
        }
    }
}
