// # Transport Trait
//
// Defines the interface to the broker connection.
//
// The bus client never talks to the network itself. A transport wraps an
// MQTT client library (or an in-process loopback for tests) and exposes the
// handful of primitives the client needs, plus a stream of events replacing
// the callback slots such libraries usually offer.
//
// ## Usage
//
// ```rust,ignore
// use housebus_core::traits::{Transport, TransportEvent, QoS};
// use tokio_stream::StreamExt;
//
// let transport = /* Transport implementation */;
// transport.connect(&options).await?;
// transport.subscribe("egeoffrey/v1/house/+/+/*/*/STATUS/#", QoS::ExactlyOnce).await?;
//
// let mut events = transport.events();
// while let Some(event) = events.next().await {
//     println!("{:?}", event);
// }
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tokio_stream::Stream;

use crate::config::GatewayTransport;
use crate::error::Error;

/// MQTT quality of service level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = Error;

    fn try_from(level: u8) -> Result<Self, Error> {
        match level {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(Error::config(format!("Invalid QoS level: {}", other))),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

/// Everything a transport needs to open a broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Broker hostname
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Client identifier presented to the broker
    pub client_id: String,
    /// Username (the house id)
    pub username: String,
    /// Password (the house passcode)
    pub password: String,
    /// Whether to use TLS
    pub use_tls: bool,
    /// CA certificate location
    pub ca_cert: String,
    /// Client certificate (optional)
    pub certfile: Option<String>,
    /// Client key (optional)
    pub keyfile: Option<String>,
    /// Wire transport
    pub transport: GatewayTransport,
    /// Connect timeout
    pub timeout: Duration,
}

/// A message as delivered by the broker, before parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Topic the message was published on
    pub topic: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// Whether the broker delivered a retained copy
    pub retained: bool,
}

impl RawMessage {
    /// Create a raw message
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, retained: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retained,
        }
    }
}

/// Events reported by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The transport re-established the connection on its own
    ///
    /// The outcome of an explicit [`Transport::connect`] call is its return
    /// value and must not be reported here as well.
    Connected,

    /// The connection dropped
    ConnectionLost {
        /// `None` for a clean disconnect, the failure otherwise
        error: Option<String>,
    },

    /// A message arrived on one of the subscribed patterns
    Message(RawMessage),
}

/// Trait for broker transport implementations
///
/// All operations are single-shot: a transport must not retry, queue or
/// reorder anything. The bus client owns buffering and retry policy.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to the broker
    ///
    /// # Returns
    ///
    /// - `Ok(())`: The connection is established
    /// - `Err(Error)`: The attempt failed or timed out
    async fn connect(&self, options: &ConnectOptions) -> Result<(), Error>;

    /// Close the connection
    async fn disconnect(&self) -> Result<(), Error>;

    /// Subscribe to a topic pattern
    async fn subscribe(&self, pattern: &str, qos: QoS) -> Result<(), Error>;

    /// Unsubscribe from a topic pattern
    async fn unsubscribe(&self, pattern: &str) -> Result<(), Error>;

    /// Publish a payload on a topic
    async fn send(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool)
        -> Result<(), Error>;

    /// Stream of connection and message events
    ///
    /// Called once by the client event loop. The stream should end only when
    /// the transport is dropped.
    fn events(&self) -> Pin<Box<dyn Stream<Item = TransportEvent> + Send + 'static>>;
}
