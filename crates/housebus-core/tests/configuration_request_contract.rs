//! Contract Test: Configuration Requests
//!
//! From protocol v2 on the broker does not retain configuration. The module
//! asks the config authority for every configuration it listens to and keeps
//! asking until each request is acknowledged.
//!
//! Constraints verified:
//! - Each configuration listener sends one SUBSCRIBE request
//! - Unacknowledged requests are re-sent every retry interval
//! - SUBSCRIBE_ACK removes the pattern, the timer disarms once none is left
//! - Retaining brokers (v1) never see a request

mod common;

use common::*;
use housebus_core::BusEvent;
use serde_json::json;
use std::time::Duration;
use tokio::sync::oneshot;

fn request_topic(version: u32) -> String {
    topic(version, FULLNAME, "controller/config", "SUBSCRIBE", "null")
}

/// Data of every SUBSCRIBE request sent so far
fn requests(probe: &TransportProbe) -> Vec<Vec<u8>> {
    probe
        .sends()
        .into_iter()
        .filter(|(topic, _, _)| *topic == request_topic(2))
        .map(|(_, payload, _)| payload)
        .collect()
}

fn ack(probe: &TransportProbe, pattern: &str) {
    probe.deliver(
        &topic(2, "controller/config", FULLNAME, "SUBSCRIBE_ACK", "null"),
        &payload(json!(pattern)),
    );
}

#[tokio::test(start_paused = true)]
async fn requests_are_retried_until_acknowledged() {
    let module = RecordingModule::new().waiting_for("sensor1");
    let (transport, probe) = MockTransport::new();
    let (mut client, mut events) = client(module, transport, 2);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        client.run_with_shutdown(Some(shutdown_rx)).await;
        client
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(requests(&probe), vec![payload(json!("sensor1"))]);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(requests(&probe).len(), 2, "re-sent after one retry interval");

    ack(&probe, "sensor1");
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(requests(&probe).len(), 2, "no request after the acknowledgment");

    shutdown_tx.send(()).unwrap();
    let client = handle.await.expect("client task completes");

    assert!(client.bus().configuration().pending().is_empty());
    assert!(!client.bus().configuration().retry_active());
    assert!(drain_events(&mut events).contains(&BusEvent::ConfigurationAcknowledged {
        pattern: "sensor1".to_string()
    }));
}

#[tokio::test(start_paused = true)]
async fn only_unacknowledged_requests_are_resent() {
    let module = RecordingModule::new()
        .waiting_for("sensor1")
        .listening_for("sensor2", None);
    let (transport, probe) = MockTransport::new();
    let (mut client, _events) = client(module, transport, 2);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        client.run_with_shutdown(Some(shutdown_rx)).await;
        client
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        requests(&probe),
        vec![payload(json!("sensor1")), payload(json!("sensor2"))]
    );

    ack(&probe, "sensor1");
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(
        requests(&probe),
        vec![
            payload(json!("sensor1")),
            payload(json!("sensor2")),
            payload(json!("sensor2")),
        ]
    );

    shutdown_tx.send(()).unwrap();
    let client = handle.await.expect("client task completes");
    assert_eq!(client.bus().configuration().pending(), ["sensor2"]);
    assert!(client.bus().configuration().retry_active());
}

#[tokio::test]
async fn versioned_listener_requests_prefixed_name() {
    let module = RecordingModule::new().listening_for("sensors/kitchen", Some(1));
    let (transport, probe) = MockTransport::new();
    let (mut client, _events) = client(module, transport, 2);

    client.start().await;

    assert!(probe.subscribes().contains(&conf_topic(2, "1/sensors/kitchen")));
    assert_eq!(requests(&probe), vec![payload(json!("1/sensors/kitchen"))]);
}

#[tokio::test]
async fn retaining_broker_gets_no_request() {
    let module = RecordingModule::new().waiting_for("sensor1");
    let (transport, probe) = MockTransport::new();
    let (mut client, _events) = client(module, transport, 1);

    client.start().await;

    assert!(!probe.sent_topics().contains(&request_topic(1)));
    assert!(client.bus().configuration().pending().is_empty());
    assert!(!client.bus().configuration().retry_active());
}

#[tokio::test]
async fn acknowledgment_from_another_module_is_ignored() {
    let module = RecordingModule::new().waiting_for("sensor1");
    let log = module.log();
    let (transport, probe) = MockTransport::new();
    let (mut client, _events) = client(module, transport, 2);
    client.start().await;

    let spoofed = topic(2, "sensor/other", FULLNAME, "SUBSCRIBE_ACK", "null");
    client
        .handle_message(housebus_core::RawMessage::new(
            spoofed,
            payload(json!("sensor1")),
            false,
        ))
        .await;

    assert_eq!(client.bus().configuration().pending(), ["sensor1"]);
    assert!(log.messages().is_empty(), "unconfigured module drops it");
}

#[tokio::test]
async fn manifest_listener_requests_manifests_on_v2() {
    for (version, expected) in [(1, 0), (2, 1)] {
        let (transport, probe) = MockTransport::new();
        let (mut client, _events) = client(RecordingModule::new(), transport, version);
        client.start().await;
        probe.clear();

        let listener = client.bus_mut().add_manifest_listener("+/+").await;

        assert_eq!(listener, topic(version, "+/+", "*/*", "MANIFEST", "#"));
        let manifest_requests = probe
            .sent_topics()
            .into_iter()
            .filter(|t| *t == topic(version, FULLNAME, "*/*", "REQ_MANIFEST", "null"))
            .count();
        assert_eq!(manifest_requests, expected, "protocol v{}", version);
    }
}
