//! Loopback demo for housebus-core
//!
//! Runs one module against an in-process broker that retains messages
//! (protocol v1) and routes every publish back to matching subscriptions.
//! The module waits for its configuration, starts, broadcasts a reading and
//! answers a PING before the demo shuts it down.
//!
//! ```bash
//! HOUSEBUS_VERBOSE=1 cargo run -p housebus-demos --bin loopback
//! ```

use anyhow::Result;
use housebus_core::message::commands;
use housebus_core::topic::{self, TopicCodec};
use housebus_core::traits::{ConnectOptions, QoS, RawMessage, Transport, TransportEvent};
use housebus_core::{Bus, BusClient, BusModule, ClientConfig, Message, ModuleIdentity};
use serde_json::json;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::Stream;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

struct BrokerState {
    subscriptions: Vec<String>,
    retained: HashMap<String, Vec<u8>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
}

/// In-process broker serving a single client
#[derive(Clone)]
struct LoopbackBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl LoopbackBroker {
    fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                subscriptions: Vec::new(),
                retained: HashMap::new(),
                events_tx,
                events_rx: Some(events_rx),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish as another module would
    fn publish(&self, name: &str, payload: Vec<u8>, retain: bool) {
        let mut state = self.lock();
        if retain {
            state.retained.insert(name.to_string(), payload.clone());
        }
        if state.subscriptions.iter().any(|p| topic::matches(p, name)) {
            let _ = state
                .events_tx
                .send(TransportEvent::Message(RawMessage::new(name, payload, false)));
        }
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackBroker {
    async fn connect(&self, options: &ConnectOptions) -> housebus_core::Result<()> {
        info!("[broker] {} connected as {}", options.client_id, options.username);
        Ok(())
    }

    async fn disconnect(&self) -> housebus_core::Result<()> {
        info!("[broker] client disconnected");
        self.lock().subscriptions.clear();
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, _qos: QoS) -> housebus_core::Result<()> {
        let mut state = self.lock();
        state.subscriptions.push(pattern.to_string());

        let retained: Vec<RawMessage> = state
            .retained
            .iter()
            .filter(|(name, _)| topic::matches(pattern, name))
            .map(|(name, payload)| RawMessage::new(name.as_str(), payload.clone(), true))
            .collect();
        for message in retained {
            let _ = state.events_tx.send(TransportEvent::Message(message));
        }
        Ok(())
    }

    async fn unsubscribe(&self, pattern: &str) -> housebus_core::Result<()> {
        self.lock().subscriptions.retain(|p| p != pattern);
        Ok(())
    }

    async fn send(
        &self,
        name: &str,
        payload: &[u8],
        _qos: QoS,
        retain: bool,
    ) -> housebus_core::Result<()> {
        self.publish(name, payload.to_vec(), retain);
        Ok(())
    }

    fn events(&self) -> Pin<Box<dyn Stream<Item = TransportEvent> + Send + 'static>> {
        match self.lock().events_rx.take() {
            Some(rx) => Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)),
            None => Box::pin(tokio_stream::empty()),
        }
    }
}

/// A thermostat that needs its setpoint before starting
#[derive(Default)]
struct Thermostat {
    setpoint: Option<f64>,
}

#[async_trait::async_trait]
impl BusModule for Thermostat {
    async fn on_init(&mut self, bus: &mut Bus) -> anyhow::Result<()> {
        bus.add_configuration_listener("thermostat", None, true).await;
        bus.add_broadcast_listener("+/+", "TEMPERATURE", "#").await;
        Ok(())
    }

    async fn on_start(&mut self, bus: &mut Bus) -> anyhow::Result<()> {
        info!("[thermostat] started with setpoint {:?}", self.setpoint);
        let house_id = bus.house_id().to_string();
        bus.publish(&house_id, "*/*", "TEMPERATURE", "living_room", Some(&json!(19.5)), false)
            .await;
        Ok(())
    }

    async fn on_message(&mut self, _bus: &mut Bus, message: &Message) -> anyhow::Result<()> {
        info!("[thermostat] {}", message);
        Ok(())
    }

    async fn on_configuration(&mut self, _bus: &mut Bus, message: &Message) -> anyhow::Result<()> {
        let setpoint = message
            .data()
            .and_then(|data| data.get("setpoint"))
            .and_then(|value| value.as_f64())
            .ok_or_else(|| anyhow::anyhow!("missing setpoint in {}", message.args))?;
        self.setpoint = Some(setpoint);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ClientConfig::from_env()?;

    let level = if config.client.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing::subscriber::set_global_default(FmtSubscriber::builder().with_max_level(level).finish())?;

    let broker = LoopbackBroker::new();
    let codec = TopicCodec::new(config.gateway.namespace.clone(), config.gateway.version);
    let house_id = config.house.id.clone();

    // Retained configuration, as the config authority would have left it
    let configuration = Message::new(&house_id, "controller/config")
        .with_data(json!({ "setpoint": 21.0 }))
        .encode_payload()?;
    broker.publish(
        &codec.build(&house_id, "controller/config", "*/*", commands::CONF, "thermostat"),
        configuration,
        true,
    );

    let (mut client, mut events) = BusClient::new(
        ModuleIdentity::new("demo", "thermostat"),
        Box::new(Thermostat::default()),
        Box::new(broker.clone()),
        config,
    )?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!("[event] {:?}", event);
        }
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let ping = codec.build(&house_id, "controller/hub", "demo/thermostat", commands::PING, "");
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        broker.publish(&ping, vec![0], false);
        tokio::time::sleep(Duration::from_secs(1)).await;
        let _ = shutdown_tx.send(());
    });

    client.run_with_shutdown(Some(shutdown_rx)).await;
    Ok(())
}
