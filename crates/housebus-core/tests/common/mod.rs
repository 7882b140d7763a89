//! Test doubles and common utilities for bus contract tests
//!
//! `MockTransport` records every call the client makes and lets the test
//! inject transport events through its `TransportProbe`. `RecordingModule`
//! records every hook invocation.

#![allow(dead_code)]

use housebus_core::error::{Error, Result};
use housebus_core::traits::{
    BusModule, ConnectOptions, QoS, RawMessage, Transport, TransportEvent,
};
use housebus_core::{Bus, BusClient, BusEvent, ClientConfig, Message, ModuleIdentity};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::Stream;

/// A call made on the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect { client_id: String, username: String },
    Disconnect,
    Subscribe(String),
    Unsubscribe(String),
    Send { topic: String, payload: Vec<u8>, retain: bool },
}

#[derive(Default)]
struct TransportState {
    calls: Mutex<Vec<TransportCall>>,
    fail_connect: AtomicBool,
    fail_send: AtomicBool,
    fail_subscribe: AtomicBool,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

/// A transport that records calls and replays injected events
pub struct MockTransport {
    state: Arc<TransportState>,
}

/// Test side of a [`MockTransport`]
///
/// Dropping the probe ends the transport event stream.
pub struct TransportProbe {
    state: Arc<TransportState>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl MockTransport {
    pub fn new() -> (Self, TransportProbe) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(TransportState {
            events_rx: Mutex::new(Some(events_rx)),
            ..Default::default()
        });

        let transport = Self {
            state: Arc::clone(&state),
        };
        (transport, TransportProbe { state, events_tx })
    }

    fn record(&self, call: TransportCall) {
        self.state.calls.lock().unwrap().push(call);
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<()> {
        self.record(TransportCall::Connect {
            client_id: options.client_id.clone(),
            username: options.username.clone(),
        });
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::transport("connection refused"));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.record(TransportCall::Disconnect);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, _qos: QoS) -> Result<()> {
        self.record(TransportCall::Subscribe(pattern.to_string()));
        if self.state.fail_subscribe.load(Ordering::SeqCst) {
            return Err(Error::transport("subscribe rejected"));
        }
        Ok(())
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<()> {
        self.record(TransportCall::Unsubscribe(pattern.to_string()));
        Ok(())
    }

    async fn send(&self, topic: &str, payload: &[u8], _qos: QoS, retain: bool) -> Result<()> {
        self.record(TransportCall::Send {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain,
        });
        if self.state.fail_send.load(Ordering::SeqCst) {
            return Err(Error::transport("publish rejected"));
        }
        Ok(())
    }

    fn events(&self) -> Pin<Box<dyn Stream<Item = TransportEvent> + Send + 'static>> {
        let rx = self
            .state
            .events_rx
            .lock()
            .unwrap()
            .take()
            .expect("events() can only be called once");

        Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx))
    }
}

impl TransportProbe {
    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.state.calls.lock().unwrap().clear();
    }

    pub fn connect_count(&self) -> usize {
        self.count(|call| matches!(call, TransportCall::Connect { .. }))
    }

    pub fn disconnect_count(&self) -> usize {
        self.count(|call| matches!(call, TransportCall::Disconnect))
    }

    /// Subscribe calls, in order
    pub fn subscribes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Subscribe(pattern) => Some(pattern),
                _ => None,
            })
            .collect()
    }

    /// Unsubscribe calls, in order
    pub fn unsubscribes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Unsubscribe(pattern) => Some(pattern),
                _ => None,
            })
            .collect()
    }

    /// Send calls as `(topic, payload, retain)`, in order
    pub fn sends(&self) -> Vec<(String, Vec<u8>, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Send {
                    topic,
                    payload,
                    retain,
                } => Some((topic, payload, retain)),
                _ => None,
            })
            .collect()
    }

    /// Topics of send calls, in order
    pub fn sent_topics(&self) -> Vec<String> {
        self.sends().into_iter().map(|(topic, _, _)| topic).collect()
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_send(&self, fail: bool) {
        self.state.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.state.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Push an event to the client event loop
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Push a message to the client event loop
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        self.emit(TransportEvent::Message(RawMessage::new(topic, payload, false)));
    }

    fn count(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        self.state
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| predicate(call))
            .count()
    }
}

/// A hook invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookCall {
    Init,
    Connect,
    PreStart,
    Start,
    PostStart,
    /// Topic of the delivered message
    Message(String),
    /// Args of the delivered configuration
    Configuration(String),
    Disconnect,
    Stop,
}

/// Shared record of hook invocations
#[derive(Clone, Default)]
pub struct HookLog(Arc<Mutex<Vec<HookCall>>>);

impl HookLog {
    pub fn calls(&self) -> Vec<HookCall> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, call: &HookCall) -> usize {
        self.0.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    /// Topics delivered to `on_message`, in order
    pub fn messages(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                HookCall::Message(topic) => Some(topic),
                _ => None,
            })
            .collect()
    }

    /// Args delivered to `on_configuration`, in order
    pub fn configurations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                HookCall::Configuration(args) => Some(args),
                _ => None,
            })
            .collect()
    }

    fn push(&self, call: HookCall) {
        self.0.lock().unwrap().push(call);
    }
}

/// A module that records hook calls
///
/// Listeners configured with the builder methods are registered in
/// `on_init`.
#[derive(Default)]
pub struct RecordingModule {
    log: HookLog,
    configurations: Vec<(String, Option<u32>, bool)>,
    broadcasts: Vec<(String, String, String)>,
    failing_message_args: Option<String>,
    failing_configuration: bool,
    failing_pre_start: bool,
}

impl RecordingModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle on the hook record, shared with the module
    pub fn log(&self) -> HookLog {
        self.log.clone()
    }

    /// Register a configuration listener holding the module back
    pub fn waiting_for(mut self, args: &str) -> Self {
        self.configurations.push((args.to_string(), None, true));
        self
    }

    /// Register a configuration listener that does not hold the module back
    pub fn listening_for(mut self, args: &str, version: Option<u32>) -> Self {
        self.configurations.push((args.to_string(), version, false));
        self
    }

    /// Register a broadcast listener
    pub fn listening_to_broadcast(mut self, from: &str, command: &str, args: &str) -> Self {
        self.broadcasts
            .push((from.to_string(), command.to_string(), args.to_string()));
        self
    }

    /// Make `on_message` fail for messages with these args
    pub fn failing_on_message(mut self, args: &str) -> Self {
        self.failing_message_args = Some(args.to_string());
        self
    }

    /// Make `on_configuration` fail
    pub fn failing_configuration(mut self) -> Self {
        self.failing_configuration = true;
        self
    }

    /// Make `on_pre_start` fail
    pub fn failing_pre_start(mut self) -> Self {
        self.failing_pre_start = true;
        self
    }
}

#[async_trait::async_trait]
impl BusModule for RecordingModule {
    async fn on_init(&mut self, bus: &mut Bus) -> anyhow::Result<()> {
        self.log.push(HookCall::Init);
        for (args, version, wait) in &self.configurations {
            bus.add_configuration_listener(args, *version, *wait).await;
        }
        for (from, command, args) in &self.broadcasts {
            bus.add_broadcast_listener(from, command, args).await;
        }
        Ok(())
    }

    async fn on_connect(&mut self, _bus: &mut Bus) -> anyhow::Result<()> {
        self.log.push(HookCall::Connect);
        Ok(())
    }

    async fn on_pre_start(&mut self, _bus: &mut Bus) -> anyhow::Result<()> {
        self.log.push(HookCall::PreStart);
        if self.failing_pre_start {
            anyhow::bail!("not ready to start");
        }
        Ok(())
    }

    async fn on_start(&mut self, _bus: &mut Bus) -> anyhow::Result<()> {
        self.log.push(HookCall::Start);
        Ok(())
    }

    async fn on_post_start(&mut self, _bus: &mut Bus) -> anyhow::Result<()> {
        self.log.push(HookCall::PostStart);
        Ok(())
    }

    async fn on_message(&mut self, _bus: &mut Bus, message: &Message) -> anyhow::Result<()> {
        self.log.push(HookCall::Message(message.topic.clone()));
        if self.failing_message_args.as_deref() == Some(message.args.as_str()) {
            anyhow::bail!("cannot handle {}", message.args);
        }
        Ok(())
    }

    async fn on_configuration(&mut self, _bus: &mut Bus, message: &Message) -> anyhow::Result<()> {
        self.log.push(HookCall::Configuration(message.args.clone()));
        if self.failing_configuration {
            anyhow::bail!("invalid configuration {}", message.args);
        }
        Ok(())
    }

    async fn on_disconnect(&mut self, _bus: &mut Bus) -> anyhow::Result<()> {
        self.log.push(HookCall::Disconnect);
        Ok(())
    }

    async fn on_stop(&mut self, _bus: &mut Bus) -> anyhow::Result<()> {
        self.log.push(HookCall::Stop);
        Ok(())
    }
}

pub const FULLNAME: &str = "sensor/temp";

/// Configuration for a local gateway speaking protocol `version`
pub fn config(version: u32) -> ClientConfig {
    let mut config = ClientConfig::new();
    config.gateway.version = version;
    config.house.passcode = "secret".to_string();
    config.client.event_channel_capacity = 100;
    config
}

/// Create a client for `sensor/temp` in house `house`
pub fn client(
    module: RecordingModule,
    transport: MockTransport,
    version: u32,
) -> (BusClient, mpsc::Receiver<BusEvent>) {
    BusClient::new(
        ModuleIdentity::new("sensor", "temp"),
        Box::new(module),
        Box::new(transport),
        config(version),
    )
    .expect("client construction succeeds")
}

/// Topic of a message in house `house`
pub fn topic(version: u32, from: &str, to: &str, command: &str, args: &str) -> String {
    format!("egeoffrey/v{}/house/{}/{}/{}/{}", version, from, to, command, args)
}

/// Topic of a configuration broadcast by the config authority
pub fn conf_topic(version: u32, args: &str) -> String {
    topic(version, "controller/config", "*/*", "CONF", args)
}

/// JSON payload carrying `data`
pub fn payload(data: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({ "data": data })).unwrap()
}

/// Every event emitted so far
pub fn drain_events(rx: &mut mpsc::Receiver<BusEvent>) -> Vec<BusEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
