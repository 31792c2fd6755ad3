use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, connect_async};

use super::message::{CoordinatorFrame, RemoteAppend, RemoteRead, WorkerFrame};
use super::{ClusterLink, Coordinator};
use crate::broker::Broker;
use crate::bus::{BusMessage, FanoutBus};
use crate::config::{ClusterSettings, Settings};
use crate::persistence::{AppendOutcome, DurableLog, SledLog};
use crate::transport::gateway::Gateway;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::transport::websocket::serve;
use crate::utils::StoreError;

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn cluster_settings(addr: &str) -> ClusterSettings {
    ClusterSettings {
        coordinator_addr: addr.to_string(),
        request_timeout_ms: 2000,
    }
}

async fn start_coordinator() -> (String, Arc<Coordinator>) {
    let log = SledLog::temporary().expect("temporary log");
    let coordinator = Coordinator::new(Arc::new(log), 64);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    tokio::spawn(coordinator.clone().serve(listener));
    (addr, coordinator)
}

async fn start_worker(coordinator_addr: &str) -> (String, Arc<Gateway>) {
    let settings = Settings::default();
    let link = ClusterLink::connect(&cluster_settings(coordinator_addr), 64)
        .await
        .expect("link");
    let broker = Broker::new(link.clone(), link, &settings.broker);
    let gateway = Gateway::new(broker, &settings);
    gateway.spawn_fanout();

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(serve(listener, gateway.clone()));
    (format!("ws://{addr}/"), gateway)
}

async fn wait_for_workers(coordinator: &Coordinator, expected: usize) {
    for _ in 0..100 {
        if coordinator.worker_count() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {expected} workers, saw {}", coordinator.worker_count());
}

async fn next_frame(ws: &mut ClientStream) -> ServerMessage {
    let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("Timed out waiting for a frame")
        .expect("Stream ended")
        .expect("WebSocket error");
    serde_json::from_slice(&msg.into_data()).expect("server frame")
}

#[test]
fn test_frames_use_snake_case_tags() {
    let frame = WorkerFrame::ReadFrom {
        request_id: 7,
        offset: 3,
    };
    let json = serde_json::to_value(&frame).unwrap();
    assert_eq!(json["type"], "read_from");

    let reply = CoordinatorFrame::Appended {
        request_id: 7,
        outcome: RemoteAppend::Duplicate { sequence_id: 4 },
    };
    let json = serde_json::to_value(&reply).unwrap();
    assert_eq!(json["type"], "appended");
    assert_eq!(json["outcome"]["status"], "duplicate");
    assert_eq!(json["outcome"]["sequence_id"], 4);
}

#[test]
fn test_remote_failures_become_transient() {
    let outcome: AppendOutcome = RemoteAppend::Failed {
        reason: "disk full".to_string(),
    }
    .into();
    assert!(matches!(
        outcome,
        AppendOutcome::TransientFailure(StoreError::Remote(_))
    ));

    let read = RemoteRead::Failed {
        reason: "disk full".to_string(),
    };
    assert!(matches!(read.into_result(), Err(StoreError::Remote(_))));
}

#[tokio::test]
async fn test_link_appends_and_dedups_through_coordinator() {
    let (addr, _coordinator) = start_coordinator().await;
    let first = ClusterLink::connect(&cluster_settings(&addr), 16).await.unwrap();
    let second = ClusterLink::connect(&cluster_settings(&addr), 16).await.unwrap();

    assert!(matches!(first.append("tok-a", "one").await, AppendOutcome::Appended(1)));
    assert!(matches!(first.append("tok-b", "two").await, AppendOutcome::Appended(2)));
    // Same token from another worker still maps to the first commit.
    assert!(matches!(second.append("tok-a", "one").await, AppendOutcome::Duplicate(1)));

    let messages = second.read_from(1).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].sequence_id, 2);
    assert_eq!(messages[0].content, "two");
}

#[tokio::test]
async fn test_commit_reaches_every_worker_including_sender() {
    let (addr, coordinator) = start_coordinator().await;
    let first = ClusterLink::connect(&cluster_settings(&addr), 16).await.unwrap();
    let second = ClusterLink::connect(&cluster_settings(&addr), 16).await.unwrap();
    let mut on_first = first.subscribe();
    let mut on_second = second.subscribe();
    wait_for_workers(&coordinator, 2).await;

    let message = BusMessage {
        sequence_id: 1,
        content: "hello".to_string(),
    };
    assert!(matches!(first.append("tok-1", "hello").await, AppendOutcome::Appended(1)));
    // Publishing through the link adds nothing; the coordinator already did.
    first.publish(message.clone()).await.unwrap();

    let got = tokio::time::timeout(Duration::from_secs(2), on_second.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, message);
    let echoed = tokio::time::timeout(Duration::from_secs(2), on_first.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, message);
    assert!(on_second.try_recv().is_err());
}

#[tokio::test]
async fn test_commit_is_broadcast_even_if_reply_is_lost() {
    let (addr, coordinator) = start_coordinator().await;
    let viewer = ClusterLink::connect(&cluster_settings(&addr), 16).await.unwrap();
    let mut on_viewer = viewer.subscribe();

    // A worker that sends an append and goes away before the reply.
    let (mut doomed, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    wait_for_workers(&coordinator, 2).await;
    let append = WorkerFrame::Append {
        request_id: 1,
        dedup_token: "tok-1".to_string(),
        content: "orphaned".to_string(),
    };
    doomed
        .send(WsMessage::Text(serde_json::to_string(&append).unwrap().into()))
        .await
        .unwrap();
    drop(doomed);

    let got = tokio::time::timeout(Duration::from_secs(2), on_viewer.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        got,
        BusMessage {
            sequence_id: 1,
            content: "orphaned".to_string(),
        }
    );

    // The publisher's retry is a duplicate and is not broadcast again.
    assert!(matches!(viewer.append("tok-1", "orphaned").await, AppendOutcome::Duplicate(1)));
    let again = tokio::time::timeout(Duration::from_millis(200), on_viewer.recv()).await;
    assert!(again.is_err());
}

#[tokio::test]
async fn test_concurrent_commits_reach_the_bus_in_sequence_order() {
    let (addr, coordinator) = start_coordinator().await;
    let first = ClusterLink::connect(&cluster_settings(&addr), 64).await.unwrap();
    let second = ClusterLink::connect(&cluster_settings(&addr), 64).await.unwrap();
    let mut on_first = first.subscribe();
    wait_for_workers(&coordinator, 2).await;

    let mut appends = Vec::new();
    for i in 0..10 {
        let link = if i % 2 == 0 { first.clone() } else { second.clone() };
        appends.push(tokio::spawn(async move {
            link.append(&format!("tok-{i}"), "x").await
        }));
    }
    for append in appends {
        assert!(matches!(append.await.unwrap(), AppendOutcome::Appended(_)));
    }

    let mut seen = Vec::new();
    for _ in 0..10 {
        let message = tokio::time::timeout(Duration::from_secs(2), on_first.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(message.sequence_id);
    }
    assert_eq!(seen, (1..=10).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_publish_on_one_worker_is_delivered_on_another() {
    let (addr, coordinator) = start_coordinator().await;
    let (first_url, _) = start_worker(&addr).await;
    let (second_url, _) = start_worker(&addr).await;
    wait_for_workers(&coordinator, 2).await;

    let (mut publisher, _) = connect_async(format!("{first_url}?offset=0")).await.unwrap();
    let (mut viewer, _) = connect_async(format!("{second_url}?offset=0")).await.unwrap();
    assert!(matches!(next_frame(&mut publisher).await, ServerMessage::Session { .. }));
    assert!(matches!(next_frame(&mut viewer).await, ServerMessage::Session { .. }));

    let publish = ClientMessage::Publish {
        content: "across".to_string(),
        dedup_token: "tok-1".to_string(),
    };
    publisher
        .send(WsMessage::Text(serde_json::to_string(&publish).unwrap().into()))
        .await
        .unwrap();

    assert_eq!(
        next_frame(&mut viewer).await,
        ServerMessage::Deliver {
            content: "across".to_string(),
            sequence_id: 1,
        }
    );
}

#[tokio::test]
async fn test_closed_link_fails_transiently() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _ = ws.close(None).await;
    });

    let link = ClusterLink::connect(&cluster_settings(&addr), 16).await.unwrap();
    let mut receiver = link.subscribe();

    assert!(matches!(
        link.append("tok-1", "lost").await,
        AppendOutcome::TransientFailure(_)
    ));

    for _ in 0..100 {
        if link.is_closed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(link.is_closed());
    assert!(matches!(
        link.read_from(0).await,
        Err(StoreError::LinkClosed)
    ));
    assert!(matches!(receiver.recv().await, Err(RecvError::Closed)));
    assert!(matches!(link.subscribe().recv().await, Err(RecvError::Closed)));
}
