// # housebus-core
//
// Client side of a home-automation message bus.
//
// Modules talk to each other only through topic-structured messages on a
// publish/subscribe broker. This library sits between one module and its
// broker connection.
//
// ## Architecture Overview
//
// - **Transport**: Trait for the broker connection (connect, subscribe, send, events)
// - **BusModule**: Trait for the module's hooks
// - **Bus**: Connection state, subscriptions, offline queue and outbound operations
// - **BusClient**: Lifecycle, message routing and the event loop
// - **ConfigSynchronizer**: Holds the module back until its configuration arrived
//
// ## Design Principles
//
// 1. **Single owner**: The client owns all state; hooks borrow the `Bus`
// 2. **Event-Driven**: Transport events arrive on one async stream
// 3. **Offline tolerant**: Subscriptions and publishes made while offline are
//    replayed on connect
// 4. **Library-First**: Binaries pick the transport and the log subscriber

pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod message;
pub mod queue;
pub mod registry;
pub mod sync;
pub mod topic;
pub mod traits;

// Re-export core types for convenience
pub use bus::{Bus, LinkState, ModuleIdentity};
pub use config::{ClientConfig, GatewayConfig, GatewayTransport, HouseConfig};
pub use engine::{BusClient, BusEvent};
pub use error::{Error, Result};
pub use message::Message;
pub use sync::{ConfigSynchronizer, Readiness};
pub use traits::{BusModule, ConnectOptions, QoS, RawMessage, Transport, TransportEvent};
