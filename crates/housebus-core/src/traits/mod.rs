//! Collaborator traits for the bus client
//!
//! - [`Transport`]: Broker connection primitives and event stream
//! - [`BusModule`]: Application callbacks

pub mod module;
pub mod transport;

pub use module::BusModule;
pub use transport::{ConnectOptions, QoS, RawMessage, Transport, TransportEvent};
