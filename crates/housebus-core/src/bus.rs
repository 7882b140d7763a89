//! Connection manager and outbound operations
//!
//! [`Bus`] owns the transport, the link state, the subscription registry,
//! the publish queue and the configuration synchronizer of one module.
//! Module hooks receive `&mut Bus` to publish and to manage listeners; the
//! [`BusClient`](crate::BusClient) drives its connect/disconnect transitions.
//!
//! None of the public operations return errors. Transport failures are
//! logged and the operation is abandoned; nothing is retried here except
//! configuration requests.

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::engine::BusEvent;
use crate::error::{Error, Result};
use crate::message::{BROADCAST, CONFIG_AUTHORITY, Message, NULL_PAYLOAD, commands};
use crate::queue::PublishQueue;
use crate::registry::{Registration, SubscriptionRegistry};
use crate::sync::{ConfigSynchronizer, Readiness, RetryTick};
use crate::topic::TopicCodec;
use crate::traits::{ConnectOptions, Transport};

/// Name of a module on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleIdentity {
    pub scope: String,
    pub name: String,
}

impl ModuleIdentity {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }

    /// `scope/name`, the sender of every message the module publishes
    pub fn fullname(&self) -> String {
        format!("{}/{}", self.scope, self.name)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for part in [&self.scope, &self.name] {
            if part.is_empty() || part.contains('/') || part.contains(['+', '#', '*']) {
                return Err(Error::config(format!(
                    "Invalid module name '{}'",
                    self.fullname()
                )));
            }
        }
        Ok(())
    }
}

/// Broker link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connected,
}

/// Per-module bus state and outbound operations
pub struct Bus {
    config: ClientConfig,
    identity: ModuleIdentity,
    fullname: String,
    codec: TopicCodec,
    transport: Box<dyn Transport>,
    link: LinkState,
    pub(crate) subscriptions: SubscriptionRegistry,
    pub(crate) queue: PublishQueue,
    pub(crate) sync: ConfigSynchronizer,
    event_tx: mpsc::Sender<BusEvent>,
}

impl Bus {
    pub(crate) fn new(
        identity: ModuleIdentity,
        config: ClientConfig,
        transport: Box<dyn Transport>,
        event_tx: mpsc::Sender<BusEvent>,
    ) -> Self {
        let codec = TopicCodec::new(config.gateway.namespace.clone(), config.gateway.version);
        let sync = ConfigSynchronizer::new(
            !config.gateway.retains_messages(),
            config.client.config_retry_interval(),
        );

        Self {
            fullname: identity.fullname(),
            identity,
            codec,
            transport,
            link: LinkState::Disconnected,
            subscriptions: SubscriptionRegistry::new(),
            queue: PublishQueue::new(),
            sync,
            event_tx,
            config,
        }
    }

    pub fn identity(&self) -> &ModuleIdentity {
        &self.identity
    }

    /// `scope/name` of the module
    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    pub fn house_id(&self) -> &str {
        &self.config.house.id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn codec(&self) -> &TopicCodec {
        &self.codec
    }

    pub fn link(&self) -> LinkState {
        self.link
    }

    pub fn is_connected(&self) -> bool {
        self.link == LinkState::Connected
    }

    pub fn readiness(&self) -> &Readiness {
        self.sync.readiness()
    }

    pub fn is_configured(&self) -> bool {
        self.sync.is_configured()
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn publish_queue(&self) -> &PublishQueue {
        &self.queue
    }

    pub fn configuration(&self) -> &ConfigSynchronizer {
        &self.sync
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// A new message from this module, in this house
    pub fn message(&self) -> Message {
        Message::new(self.house_id(), self.fullname())
    }

    /// Connection options derived from the configuration
    pub fn connect_options(&self) -> ConnectOptions {
        let gateway = &self.config.gateway;
        ConnectOptions {
            host: gateway.hostname.clone(),
            port: gateway.port,
            client_id: format!(
                "{}-{}-{}-{}",
                gateway.namespace, self.config.house.id, self.identity.scope, self.identity.name
            ),
            username: self.config.house.id.clone(),
            password: self.config.house.passcode.clone(),
            use_tls: gateway.ssl,
            ca_cert: gateway.ca_cert.clone(),
            certfile: gateway.certfile.clone(),
            keyfile: gateway.keyfile.clone(),
            transport: gateway.transport,
            timeout: self.config.client.connect_timeout(),
        }
    }

    /// Open the broker connection
    ///
    /// Returns `true` on success. Failures are logged and leave the link
    /// disconnected.
    pub(crate) async fn connect(&mut self) -> bool {
        let options = self.connect_options();
        debug!(
            "Connecting to {}:{} (ssl={})",
            options.host, options.port, options.use_tls
        );

        let result = match tokio::time::timeout(options.timeout, self.transport.connect(&options)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::transport(format!(
                "connect timed out after {:?}",
                options.timeout
            ))),
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                error!("Unable to connect to {}:{}: {}", options.host, options.port, e);
                self.emit(BusEvent::ConnectFailed {
                    error: e.to_string(),
                });
                false
            }
        }
    }

    /// Record a successful connect
    pub(crate) fn mark_connected(&mut self) {
        info!(
            "Connected to gateway {}:{}",
            self.config.gateway.hostname, self.config.gateway.port
        );
        self.link = LinkState::Connected;
        self.emit(BusEvent::Connected);
    }

    /// Subscribe every wanted pattern, then flush the publish queue
    pub(crate) async fn resume(&mut self) {
        for pattern in self.subscriptions.replay() {
            self.subscribe(&pattern).await;
        }

        let entries = self.queue.take_all();
        if entries.is_empty() {
            return;
        }

        let count = entries.len();
        debug!("Flushing {} queued message(s)", count);
        for entry in entries {
            if let Err(e) = self
                .transport
                .send(&entry.topic, &entry.payload, self.config.gateway.qos_publish, entry.retain)
                .await
            {
                error!("Unable to publish to topic {}: {}", entry.topic, e);
            }
        }
        self.emit(BusEvent::QueueFlushed { count });
    }

    /// Close the connection if it is up
    ///
    /// Returns `true` if the module was connected.
    pub(crate) async fn close(&mut self) -> bool {
        if !self.is_connected() {
            return false;
        }

        if let Err(e) = self.transport.disconnect().await {
            error!(
                "Unable to disconnect from {}:{}: {}",
                self.config.gateway.hostname, self.config.gateway.port, e
            );
        }
        self.mark_disconnected();
        true
    }

    /// Record a closed or lost connection
    ///
    /// Live subscriptions go back to the wanted list for the next connect.
    pub(crate) fn mark_disconnected(&mut self) {
        self.link = LinkState::Disconnected;
        self.subscriptions.suspend();
    }

    /// Publish data to a module
    ///
    /// # Parameters
    ///
    /// - `house_id`: House to publish in
    /// - `to_module`: Recipient (`scope/name` or `*/*`)
    /// - `command`: Command
    /// - `args`: Command arguments (empty becomes the `null` placeholder)
    /// - `data`: Payload data, `None` sends a null message
    /// - `retain`: Whether the broker should retain the message
    pub async fn publish(
        &mut self,
        house_id: &str,
        to_module: &str,
        command: &str,
        args: &str,
        data: Option<&Value>,
        retain: bool,
    ) {
        let topic = self.codec.build(house_id, &self.fullname, to_module, command, args);
        let payload = match data {
            Some(data) => match serde_json::to_vec(&serde_json::json!({ "data": data })) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Unable to encode payload for {}: {}", topic, e);
                    return;
                }
            },
            None => NULL_PAYLOAD.to_vec(),
        };
        self.publish_raw(topic, payload, retain).await;
    }

    /// Send a message to another module
    ///
    /// Messages without a proper sender, recipient, command or house are
    /// dropped with a warning. A configuration schema is prefixed to args.
    pub async fn send(&mut self, message: &Message) {
        if self.config.client.verbose {
            debug!("Publishing message {}", message);
        }

        if message.sender.is_empty()
            || message.sender == BROADCAST
            || message.recipient.is_empty()
            || message.command.is_empty()
            || message.house_id.is_empty()
        {
            warn!("invalid message to send: {}", message);
            return;
        }

        let payload = match message.encode_payload() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Unable to encode message {}: {}", message, e);
                return;
            }
        };

        let topic = self.codec.build(
            &message.house_id,
            &self.fullname,
            &message.recipient,
            &message.command,
            &message.wire_args(),
        );
        self.publish_raw(topic, payload, message.retain).await;
    }

    /// Send now when connected, queue otherwise
    async fn publish_raw(&mut self, topic: String, payload: Vec<u8>, retain: bool) {
        if !self.is_connected() {
            self.queue.push(topic, payload, retain);
            return;
        }

        if let Err(e) = self
            .transport
            .send(&topic, &payload, self.config.gateway.qos_publish, retain)
            .await
        {
            error!("Unable to publish to topic {}: {}", topic, e);
        }
    }

    /// Add a listener
    ///
    /// # Parameters
    ///
    /// - `house_id`: House to listen in
    /// - `from_module`: Sender pattern
    /// - `to_module`: Recipient pattern
    /// - `command`: Command pattern
    /// - `filter`: Args pattern
    /// - `wait_for_it`: Hold the module back until a configuration arrives
    ///   on this topic
    ///
    /// # Returns
    ///
    /// The subscribed topic pattern, used to remove the listener
    pub async fn add_listener(
        &mut self,
        house_id: &str,
        from_module: &str,
        to_module: &str,
        command: &str,
        filter: &str,
        wait_for_it: bool,
    ) -> String {
        let topic = self.codec.build(house_id, from_module, to_module, command, filter);

        if wait_for_it {
            self.sync.require(&topic);
            debug!("will wait for configuration on {}", topic);
        }

        match self.subscriptions.add(&topic, self.is_connected()) {
            Registration::SubscribeNow => self.subscribe(&topic).await,
            Registration::Deferred => debug!("will subscribe {} once connected", topic),
            Registration::AlreadyTracked => {}
        }

        topic
    }

    /// Listen for a configuration file
    ///
    /// # Parameters
    ///
    /// - `args`: Configuration file name (pattern)
    /// - `version`: Configuration schema version, prefixed to the name
    /// - `wait_for_it`: Hold the module back until it arrives
    ///
    /// On non-retaining brokers the file is also requested from the config
    /// authority, and the request repeated until acknowledged.
    pub async fn add_configuration_listener(
        &mut self,
        args: &str,
        version: Option<u32>,
        wait_for_it: bool,
    ) -> String {
        let filename = match version {
            Some(version) => format!("{}/{}", version, args),
            None => args.to_string(),
        };

        let house_id = self.config.house.id.clone();
        let topic = self
            .add_listener(
                &house_id,
                CONFIG_AUTHORITY,
                BROADCAST,
                commands::CONF,
                &filename,
                wait_for_it,
            )
            .await;

        if self.sync.track_request(&filename, Instant::now()) {
            self.send_configuration_request(&filename).await;
        }

        topic
    }

    /// Listen for requests addressed to this module
    pub async fn add_request_listener(&mut self, from_module: &str, command: &str, args: &str) -> String {
        let house_id = self.config.house.id.clone();
        let to_module = self.fullname.clone();
        self.add_listener(&house_id, from_module, &to_module, command, args, false)
            .await
    }

    /// Listen for broadcasts from the given module
    pub async fn add_broadcast_listener(
        &mut self,
        from_module: &str,
        command: &str,
        args: &str,
    ) -> String {
        let house_id = self.config.house.id.clone();
        self.add_listener(&house_id, from_module, BROADCAST, command, args, false)
            .await
    }

    /// Listen for messages between two other modules
    pub async fn add_inspection_listener(
        &mut self,
        from_module: &str,
        to_module: &str,
        command: &str,
        args: &str,
    ) -> String {
        let house_id = self.config.house.id.clone();
        self.add_listener(&house_id, from_module, to_module, command, args, false)
            .await
    }

    /// Listen for module manifests
    ///
    /// `+/+` listens to every module. Manifests are not retained from
    /// protocol v2 on, so they are requested explicitly.
    pub async fn add_manifest_listener(&mut self, from_module: &str) -> String {
        let topic = self
            .add_broadcast_listener(from_module, commands::MANIFEST, "#")
            .await;

        if self.sync.requests_enabled() {
            let recipient = if from_module == "+/+" { BROADCAST } else { from_module };
            let request = self
                .message()
                .with_recipient(recipient)
                .with_command(commands::REQ_MANIFEST);
            self.send(&request).await;
        }

        topic
    }

    /// Remove a listener added earlier
    pub async fn remove_listener(&mut self, topic: &str) {
        debug!("Unsubscribing from {}", topic);
        if !self.subscriptions.is_tracked(topic) {
            debug!("{} was never subscribed, nothing to remove", topic);
            return;
        }

        if self.subscriptions.remove(topic)
            && self.is_connected()
            && let Err(e) = self.transport.unsubscribe(topic).await
        {
            error!("Unable to unsubscribe from topic {}: {}", topic, e);
        }
    }

    /// Ask the config authority to replace a configuration file with a new
    /// schema version
    pub async fn upgrade_config(
        &mut self,
        filename: &str,
        from_version: u32,
        to_version: u32,
        content: Value,
    ) {
        let delete = self
            .message()
            .with_recipient(CONFIG_AUTHORITY)
            .with_command(commands::DELETE)
            .with_args(filename)
            .with_config_schema(from_version);
        self.send(&delete).await;

        let save = self
            .message()
            .with_recipient(CONFIG_AUTHORITY)
            .with_command(commands::SAVE)
            .with_args(filename)
            .with_config_schema(to_version)
            .with_data(content);
        self.send(&save).await;

        info!(
            "Requesting to upgrade configuration {} from v{} to v{}",
            filename, from_version, to_version
        );
    }

    async fn subscribe(&mut self, pattern: &str) {
        debug!("Subscribing topic {}", pattern);
        if let Err(e) = self
            .transport
            .subscribe(pattern, self.config.gateway.qos_subscribe)
            .await
        {
            error!("Unable to subscribe to topic {}: {}", pattern, e);
        }
    }

    async fn send_configuration_request(&mut self, pattern: &str) {
        let request = self
            .message()
            .with_recipient(CONFIG_AUTHORITY)
            .with_command(commands::SUBSCRIBE)
            .with_data(pattern);
        self.send(&request).await;
        self.emit(BusEvent::ConfigurationRequested {
            pattern: pattern.to_string(),
        });
    }

    /// Forget an acknowledged configuration request
    pub(crate) fn acknowledge_configuration_request(&mut self, pattern: &str) {
        if self.sync.acknowledge(pattern) {
            debug!("controller/config acknowledged request for {}", pattern);
            self.emit(BusEvent::ConfigurationAcknowledged {
                pattern: pattern.to_string(),
            });
        }
    }

    /// Fire the configuration retry timer if it is due
    pub(crate) async fn retry_configuration_requests(&mut self) {
        match self.sync.retry_tick(Instant::now()) {
            RetryTick::Idle => {}
            RetryTick::Cancelled => debug!("All configuration requests acknowledged"),
            RetryTick::Resend(patterns) => {
                for pattern in patterns {
                    self.send_configuration_request(&pattern).await;
                }
            }
        }
    }

    /// Emit a bus event
    pub(crate) fn emit(&self, event: BusEvent) {
        if self.event_tx.try_send(event).is_err() {
            warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
        }
    }
}
