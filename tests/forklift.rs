mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{connected, eventually, manager, next_event, Call};
use forklift_link::codec::{MoveCommand, Pose, ProgressMessage};
use forklift_link::mqtt::{LinkEvent, QoS};
use forklift_link::{ForkliftClient, ForkliftError, ManagerEvent};
use tokio::sync::mpsc;

#[tokio::test]
async fn malformed_telemetry_is_skipped() {
    let (manager, broker, _events) = manager();
    let client = ForkliftClient::new(Arc::new(manager));
    let (tx, mut rx) = mpsc::channel(16);
    client.attach(tx, None).unwrap();
    connected(client.manager(), &broker).await;

    let telemetry = client.manager().topics().telemetry();
    assert_eq!(telemetry, "fk/wh01/A/fl01/jet/01/telemetry");
    let payloads = [
        b"not json".to_vec(),
        br#"{"x":1}"#.to_vec(),
        br#"{"x":0.5,"y":0.3}"#.to_vec(),
    ];
    for payload in payloads {
        broker
            .inject(LinkEvent::Message {
                topic: telemetry.clone(),
                payload,
            })
            .await;
    }

    let pose = next_event(&mut rx, |event| match event {
        ManagerEvent::Pose(pose) => Some(pose),
        _ => None,
    })
    .await;
    assert_eq!(pose, Pose { x: 0.5, y: 0.3 });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn ack_and_progress_are_surfaced() {
    let (manager, broker, _events) = manager();
    let client = ForkliftClient::new(Arc::new(manager));
    let (tx, mut rx) = mpsc::channel(16);
    client.attach(tx, Some("07")).unwrap();
    connected(client.manager(), &broker).await;

    let topics = client.manager().topics().clone();
    assert!(broker
        .subscribed()
        .contains(&"fk/wh01/A/fl01/jet/07/telemetry".to_string()));

    broker
        .inject(LinkEvent::Message {
            topic: topics.ack().to_string(),
            payload: b"ok:1700000000000".to_vec(),
        })
        .await;
    broker
        .inject(LinkEvent::Message {
            topic: topics.progress().to_string(),
            payload: br#"{"from":"jet","stage":"lifting","detail":null,"ts":5}"#.to_vec(),
        })
        .await;

    assert_eq!(
        rx.recv().await,
        Some(ManagerEvent::Ack("ok:1700000000000".to_string()))
    );
    assert_eq!(
        rx.recv().await,
        Some(ManagerEvent::Progress(ProgressMessage {
            from: "jet".to_string(),
            stage: "lifting".to_string(),
            detail: None,
            ts: 5,
        }))
    );
}

#[tokio::test]
async fn move_command_goes_to_the_command_topic() {
    let (manager, broker, _events) = manager();
    let client = ForkliftClient::new(Arc::new(manager));
    connected(client.manager(), &broker).await;

    let mut handle = client.send_move("  PAL-42 ", "dock 3").unwrap();
    assert_eq!(handle.try_outcome(), None);

    let command = client.manager().topics().command().to_string();
    assert_eq!(command, "fk/wh01/A/fl01/dev/cmd");
    eventually(|| broker.published_to(&command).len() == 1).await;

    let call = broker
        .calls()
        .into_iter()
        .find(|call| matches!(call, Call::Publish { topic, .. } if *topic == command))
        .unwrap();
    let Call::Publish {
        payload,
        qos,
        retain,
        ..
    } = call
    else {
        unreachable!()
    };
    assert_eq!(qos, QoS::AtLeastOnce);
    assert!(!retain);

    let sent = MoveCommand::decode(&payload).unwrap();
    assert_eq!(sent.target_uid, "PAL-42");
    assert_eq!(sent.destination, "dock 3");
    assert_eq!(sent.command, "move_to");
    assert_eq!(sent.from, "forklift_wh01-A-fl01-ph-01");
    assert_eq!(sent.req_id, sent.ts);
}

#[tokio::test]
async fn blank_move_fields_are_refused() {
    let (manager, broker, _events) = manager();
    let client = ForkliftClient::new(Arc::new(manager));
    connected(client.manager(), &broker).await;

    assert!(matches!(
        client.send_move("   ", "dock 3"),
        Err(ForkliftError::MissingField("target_uid"))
    ));
    assert!(matches!(
        client.send_move("PAL-42", ""),
        Err(ForkliftError::MissingField("destination"))
    ));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(broker
        .published_to(client.manager().topics().command())
        .is_empty());
}

#[tokio::test]
async fn move_while_offline_resolves_false() {
    let (manager, _broker, _events) = manager();
    let client = ForkliftClient::new(Arc::new(manager));

    let mut handle = client.send_move("PAL-42", "dock 3").unwrap();
    assert_eq!(handle.try_outcome(), Some(false));
}

#[tokio::test]
async fn status_with_extra_is_retained() {
    let (manager, broker, _events) = manager();
    let client = ForkliftClient::new(Arc::new(manager));
    connected(client.manager(), &broker).await;
    broker.clear_calls();

    client.publish_status(true, Some("battery 80%")).unwrap();
    let status = client.manager().topics().status().to_string();
    eventually(|| broker.published_to(&status).len() == 1).await;

    let json: serde_json::Value =
        serde_json::from_slice(&broker.published_to(&status)[0]).unwrap();
    assert_eq!(json["extra"], "battery 80%");
    assert!(broker.calls().iter().any(|call| matches!(
        call,
        Call::Publish { topic, retain: true, .. } if *topic == status
    )));
}

#[tokio::test]
async fn progress_report_goes_to_the_progress_topic() {
    let (manager, broker, _events) = manager();
    let client = ForkliftClient::new(Arc::new(manager));
    connected(client.manager(), &broker).await;

    assert!(matches!(
        client.send_progress(" ", None),
        Err(ForkliftError::MissingField("stage"))
    ));
    client.send_progress(" lifting ", Some("pallet 7")).unwrap();

    let progress = client.manager().topics().progress().to_string();
    eventually(|| broker.published_to(&progress).len() == 1).await;
    let sent = ProgressMessage::parse(&broker.published_to(&progress)[0]).unwrap();
    assert_eq!(sent.from, "forklift_wh01-A-fl01-ph-01");
    assert_eq!(sent.stage, "lifting");
    assert_eq!(sent.detail.as_deref(), Some("pallet 7"));
}
