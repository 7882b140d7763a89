//! Bus client: lifecycle, message routing and event loop
//!
//! The BusClient is responsible for:
//! - Starting and stopping the module (hooks, status broadcasts)
//! - Reacting to transport events (connect, connection loss, messages)
//! - Routing inbound messages to the right module hook
//! - Firing the configuration request retry timer
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐
//! │  Transport  │─── TransportEvent ───┐
//! └─────────────┘                      │
//!                                      ▼
//!                             ┌──────────────┐
//!                             │  BusClient   │
//!                             └──────────────┘
//!                                      │
//!         ┌────────────────────────────┼───────────────────────────┐
//!         │                            │                           │
//!         ▼                            ▼                           ▼
//! ┌───────────────┐           ┌──────────────┐           ┌─────────────┐
//! │      Bus      │           │  BusModule   │           │   Events    │
//! │ (subscribe,   │           │  (hooks)     │           │  (notify)   │
//! │  publish)     │           └──────────────┘           └─────────────┘
//! └───────────────┘
//! ```
//!
//! ## Routing
//!
//! An inbound message is handled once, for the first subscribed pattern
//! that matches its topic:
//!
//! 1. `CONF` from `controller/config`: configuration hook, then the wait list
//! 2. `PING`: answered with `PONG`, whatever the readiness
//! 3. `SUBSCRIBE_ACK` from `controller/config`: request acknowledged
//! 4. Anything else: message hook if configured, dropped otherwise

use std::future;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::bus::{Bus, ModuleIdentity};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::message::{BROADCAST, CONFIG_AUTHORITY, Message, commands};
use crate::sync::Satisfaction;
use crate::traits::{BusModule, RawMessage, Transport, TransportEvent};

/// Events emitted by the BusClient
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// Module started
    Started { module: String },

    /// Connection established
    Connected,

    /// Connection attempt failed
    ConnectFailed { error: String },

    /// Connection closed by the broker or the network
    ConnectionLost { error: Option<String> },

    /// Connection closed by `stop()`
    Disconnected,

    /// Messages queued while offline were sent
    QueueFlushed { count: usize },

    /// Configuration requested from the config authority
    ConfigurationRequested { pattern: String },

    /// Configuration request acknowledged
    ConfigurationAcknowledged { pattern: String },

    /// Every mandatory configuration has arrived
    Configured,

    /// Inbound message discarded
    MessageDropped { topic: String, reason: String },

    /// Event loop stopped
    Stopped { reason: String },
}

/// How a matched inbound message is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Configuration,
    Ping,
    SubscribeAck,
    Generic,
}

impl Route {
    fn of(message: &Message) -> Self {
        let from_authority = message.sender == CONFIG_AUTHORITY;
        match message.command.as_str() {
            commands::CONF if from_authority => Route::Configuration,
            commands::PING => Route::Ping,
            commands::SUBSCRIBE_ACK if from_authority => Route::SubscribeAck,
            _ => Route::Generic,
        }
    }
}

/// Bus client driving one module
///
/// ## Lifecycle
///
/// 1. Create with [`BusClient::new()`]
/// 2. Run with [`BusClient::run()`], or call [`BusClient::start()`],
///    [`BusClient::handle_event()`] and [`BusClient::stop()`] directly
/// 3. The run loop stops on Ctrl-C or when the transport event stream ends
///
/// ## Threading
///
/// The client owns all bus state and processes one event at a time. Hooks
/// run to completion before the next event is handled.
pub struct BusClient {
    bus: Bus,
    module: Box<dyn BusModule>,
}

impl BusClient {
    /// Create a new bus client
    ///
    /// # Parameters
    ///
    /// - `identity`: Scope and name of the module
    /// - `module`: Module hooks
    /// - `transport`: Broker transport
    /// - `config`: Client configuration
    ///
    /// # Returns
    ///
    /// A tuple of (client, event_receiver) where event_receiver yields bus events
    pub fn new(
        identity: ModuleIdentity,
        module: Box<dyn BusModule>,
        transport: Box<dyn Transport>,
        config: ClientConfig,
    ) -> Result<(Self, mpsc::Receiver<BusEvent>)> {
        config.validate()?;
        identity.validate()?;

        let (tx, rx) = mpsc::channel(config.client.event_channel_capacity);
        let client = Self {
            bus: Bus::new(identity, config, transport, tx),
            module,
        };

        Ok((client, rx))
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }

    /// Start the module
    ///
    /// Runs `on_init`, connects, listens for requests addressed to the
    /// module and broadcasts `STATUS 1`. The start hooks (`on_pre_start`,
    /// `on_start`, `on_post_start`) run now if no configuration is awaited,
    /// otherwise once the last one arrives.
    pub async fn start(&mut self) {
        info!("Starting module {}", self.bus.fullname());

        let result = self.module.on_init(&mut self.bus).await;
        report_hook("on_init", result, None);

        if self.bus.connect().await {
            self.handle_connected().await;
        }

        self.bus.add_request_listener("+/+", "+", "#").await;
        self.broadcast_status("1").await;
        self.bus.emit(BusEvent::Started {
            module: self.bus.fullname().to_string(),
        });

        if self.bus.is_configured() {
            self.run_on_start().await;
        } else {
            info!(
                "Waiting for {} configuration(s) before starting",
                self.bus.configuration().waiting().len()
            );
        }
    }

    /// Stop the module
    ///
    /// Broadcasts `STATUS 0`, runs `on_stop`, then disconnects. The
    /// disconnect hook only runs if the module was connected.
    pub async fn stop(&mut self) {
        info!("Stopping module {}", self.bus.fullname());
        self.broadcast_status("0").await;

        let result = self.module.on_stop(&mut self.bus).await;
        report_hook("on_stop", result, None);

        if self.bus.close().await {
            info!("Disconnected from gateway");
            let result = self.module.on_disconnect(&mut self.bus).await;
            report_hook("on_disconnect", result, None);
            self.bus.emit(BusEvent::Disconnected);
        }
    }

    /// Handle one transport event
    pub async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.handle_connected().await,
            TransportEvent::ConnectionLost { error } => self.handle_connection_lost(error).await,
            TransportEvent::Message(raw) => self.handle_message(raw).await,
        }
    }

    /// Connection established: connect hook, then replay subscriptions and
    /// flush the publish queue
    pub async fn handle_connected(&mut self) {
        self.bus.mark_connected();

        let result = self.module.on_connect(&mut self.bus).await;
        report_hook("on_connect", result, None);

        self.bus.resume().await;
    }

    /// Connection lost
    ///
    /// # Parameters
    ///
    /// - `error`: Reason given by the transport, `None` for a clean close
    pub async fn handle_connection_lost(&mut self, error: Option<String>) {
        match &error {
            Some(reason) => warn!("Unexpected disconnection from gateway: {}", reason),
            None => debug!("Disconnected from gateway"),
        }

        self.bus.mark_disconnected();
        let result = self.module.on_disconnect(&mut self.bus).await;
        report_hook("on_disconnect", result, None);
        self.bus.emit(BusEvent::ConnectionLost { error });
    }

    /// Route an inbound message
    pub async fn handle_message(&mut self, raw: RawMessage) {
        let version = self.bus.config().gateway.version;
        let message = match Message::parse(&raw.topic, &raw.payload, raw.retained, version) {
            Ok(message) => message,
            Err(e) => {
                warn!("Discarding message on {}: {}", raw.topic, e);
                self.drop_message(raw.topic, e.to_string());
                return;
            }
        };

        if self.bus.config().client.verbose {
            debug!("Received message {}", message);
        }

        let Some(pattern) = self
            .bus
            .subscriptions()
            .first_match(&message.topic)
            .map(str::to_string)
        else {
            debug!("No subscription matches {}, ignoring", message.topic);
            return;
        };

        match Route::of(&message) {
            Route::Configuration => self.handle_configuration(message).await,
            Route::Ping => self.handle_ping(&message).await,
            Route::SubscribeAck => self.handle_subscribe_ack(&message),
            Route::Generic if self.bus.is_configured() => {
                let result = self.module.on_message(&mut self.bus, &message).await;
                report_hook("on_message", result, Some(&message));
            }
            Route::Generic => {
                debug!(
                    "Not configured yet, dropping {} (matched {})",
                    message, pattern
                );
                self.drop_message(message.topic, "module not configured".to_string());
            }
        }
    }

    async fn handle_configuration(&mut self, message: Message) {
        let result = self.module.on_configuration(&mut self.bus, &message).await;
        if report_hook("on_configuration", result, Some(&message)) {
            return;
        }

        match self.bus.sync.satisfy(&message.topic) {
            Satisfaction::NotWaiting => {}
            Satisfaction::Unmatched => {
                debug!("Holding configuration {} until configured", message.args);
                self.bus.sync.enqueue(message);
            }
            Satisfaction::Partial { remaining } => {
                debug!(
                    "Received configuration {}, {} still awaited",
                    message.args, remaining
                );
            }
            Satisfaction::Completed { queued } => {
                info!("Received all mandatory configuration");
                self.bus.emit(BusEvent::Configured);

                for held in queued {
                    let result = self.module.on_configuration(&mut self.bus, &held).await;
                    report_hook("on_configuration", result, Some(&held));
                }
                self.run_on_start().await;
            }
        }
    }

    async fn handle_ping(&mut self, message: &Message) {
        let pong = message
            .reply(self.bus.fullname())
            .with_command(commands::PONG);
        self.bus.send(&pong).await;
    }

    fn handle_subscribe_ack(&mut self, message: &Message) {
        match message.data_str() {
            Some(pattern) => self.bus.acknowledge_configuration_request(pattern),
            None => warn!("Acknowledgment without a pattern: {}", message),
        }
    }

    /// Run the start hooks in order, stopping at the first failure
    async fn run_on_start(&mut self) {
        let result = self.module.on_pre_start(&mut self.bus).await;
        if report_hook("on_pre_start", result, None) {
            return;
        }
        let result = self.module.on_start(&mut self.bus).await;
        if report_hook("on_start", result, None) {
            return;
        }
        let result = self.module.on_post_start(&mut self.bus).await;
        report_hook("on_post_start", result, None);
    }

    async fn broadcast_status(&mut self, status: &str) {
        let message = self
            .bus
            .message()
            .with_recipient(BROADCAST)
            .with_command(commands::STATUS)
            .with_args(status);
        self.bus.send(&message).await;
    }

    fn drop_message(&self, topic: String, reason: String) {
        self.bus.emit(BusEvent::MessageDropped { topic, reason });
    }

    /// Run the client until Ctrl-C
    ///
    /// Starts the module, processes transport events and configuration
    /// retries, and stops the module on exit.
    pub async fn run(&mut self) {
        self.run_internal(None).await
    }

    /// Run the client until `shutdown_rx` fires
    ///
    /// Like [`BusClient::run()`] with a programmatic shutdown signal. With
    /// `None` the client waits for Ctrl-C.
    pub async fn run_with_shutdown(&mut self, shutdown_rx: Option<oneshot::Receiver<()>>) {
        self.run_internal(shutdown_rx).await
    }

    async fn run_internal(&mut self, shutdown_rx: Option<oneshot::Receiver<()>>) {
        let mut events = self.bus.transport().events();
        self.start().await;

        let shutdown = shutdown_signal(shutdown_rx);
        tokio::pin!(shutdown);

        let reason = loop {
            let deadline = self.bus.configuration().next_retry();

            tokio::select! {
                event = events.next() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("Transport event stream closed");
                        break "Transport event stream closed";
                    }
                },

                _ = retry_deadline(deadline) => {
                    self.bus.retry_configuration_requests().await;
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break "Shutdown signal";
                }
            }
        };

        self.stop().await;
        self.bus.emit(BusEvent::Stopped {
            reason: reason.to_string(),
        });
    }
}

/// Log a hook failure, returning `true` if the hook failed
fn report_hook(hook: &'static str, result: anyhow::Result<()>, message: Option<&Message>) -> bool {
    let Err(e) = result else {
        return false;
    };

    let error = Error::hook(hook, format!("{:#}", e));
    match message {
        Some(message) => error!("{} ({})", error, message),
        None => error!("{}", error),
    }
    true
}

async fn retry_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

async fn shutdown_signal(shutdown_rx: Option<oneshot::Receiver<()>>) {
    match shutdown_rx {
        Some(rx) => {
            // A dropped sender counts as a shutdown request
            let _ = rx.await;
        }
        None => {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Unable to listen for Ctrl-C: {}", e);
                future::pending::<()>().await;
            }
        }
    }
}
