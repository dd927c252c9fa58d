//! Integration tests for the connection lifecycle
//!
//! Driven through the scripted in-memory transport with a paused clock.

mod common;

use common::*;
use realtime_core::core::ack::AckCallback;
use realtime_core::core::config::DEFAULT_REALTIME_HOST;
use realtime_core::core::params::ResumeToken;
use realtime_core::protocol::{Action, ErrorInfo, Message, ProtocolMessage};
use realtime_core::{ChannelState, ClientOptions, ConnectionState, RealtimeError};
use std::time::Duration;
use tokio::sync::oneshot;

fn callback() -> (AckCallback, oneshot::Receiver<Result<(), ErrorInfo>>) {
    let (tx, rx) = oneshot::channel();
    let callback: AckCallback = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (callback, rx)
}

#[tokio::test(start_paused = true)]
async fn test_connect_assigns_identity() {
    let network = FakeNetwork::cooperative();
    let client = test_client(&network);
    let mut changes = client.connection().on_state_change();

    wait_for_state(&client, ConnectionState::Connected).await;

    assert_eq!(client.connection().id().as_deref(), Some("conn-1"));
    assert_eq!(client.connection().key().as_deref(), Some("key-conn-1"));
    let states: Vec<_> = changes.drain().iter().map(|c| c.current).collect();
    assert_eq!(states, vec![ConnectionState::Connecting, ConnectionState::Connected]);

    let params = network.last().params().clone();
    assert_eq!(params.host, DEFAULT_REALTIME_HOST);
    assert!(params.resume.is_none());
    assert!(params.tls);

    verbose_println!("Connected as {:?}", client.connection().id());
}

#[tokio::test(start_paused = true)]
async fn test_no_connection_without_auto_connect() {
    let network = FakeNetwork::cooperative();
    let options = ClientOptions {
        auto_connect: false,
        ..test_options()
    };
    let client = client_with(&network, options);
    settle().await;

    assert_eq!(client.connection().state(), ConnectionState::Initialized);
    assert_eq!(network.attempts(), 0);

    client.connect().unwrap();
    wait_for_state(&client, ConnectionState::Connected).await;
    assert_eq!(network.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_sends_close_and_reaches_closed() {
    let network = FakeNetwork::cooperative();
    let client = test_client(&network);
    wait_for_state(&client, ConnectionState::Connected).await;

    let mut changes = client.connection().on_state_change();
    client.close().unwrap();
    wait_for_state(&client, ConnectionState::Closed).await;

    let states: Vec<_> = changes.drain().iter().map(|c| c.current).collect();
    assert_eq!(states, vec![ConnectionState::Closing, ConnectionState::Closed]);
    assert_eq!(network.last().sent_actions(), vec![Action::Close]);
    assert_eq!(network.last().state(), realtime_core::TransportState::Closed);
    assert!(client.connection().key().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_close_without_reply_is_forced() {
    let network = FakeNetwork::cooperative();
    let client = test_client(&network);
    wait_for_state(&client, ConnectionState::Connected).await;
    network.update(|script| script.respond = false);

    client.close().unwrap();
    wait_for_state(&client, ConnectionState::Closed).await;
    assert_eq!(network.last().sent_actions(), vec![Action::Close]);
}

#[tokio::test(start_paused = true)]
async fn test_close_before_connect() {
    let network = FakeNetwork::cooperative();
    let options = ClientOptions {
        auto_connect: false,
        ..test_options()
    };
    let client = client_with(&network, options);

    client.close().unwrap();
    wait_for_state(&client, ConnectionState::Closed).await;
    assert_eq!(network.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_ping_round_trip() {
    let network = FakeNetwork::cooperative();
    let client = test_client(&network);

    let early = client.connection().ping().await;
    assert!(matches!(early, Err(RealtimeError::InvalidState(_))));

    wait_for_state(&client, ConnectionState::Connected).await;
    let rtt = client.connection().ping().await.unwrap();
    assert!(rtt < Duration::from_secs(1));
    assert_eq!(network.last().sent_with(Action::Heartbeat).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ping_times_out() {
    let network = FakeNetwork::cooperative();
    let client = test_client(&network);
    wait_for_state(&client, ConnectionState::Connected).await;
    network.update(|script| script.respond = false);

    let result = client.connection().ping().await;
    assert!(matches!(result, Err(RealtimeError::Timeout(_))));
    assert_eq!(client.connection().state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_fails_connection_channels_and_pending() {
    let network = FakeNetwork::cooperative();
    let client = test_client(&network);
    wait_for_state(&client, ConnectionState::Connected).await;

    let channel = client.channel("orders");
    channel.attach().await.unwrap();

    network.update(|script| script.respond = false);
    let (callback, outcome) = callback();
    channel
        .publish_with_callback(vec![Message::new("order", 1)], Some(callback))
        .unwrap();
    settle().await;
    assert_eq!(network.last().sent_with(Action::Message).len(), 1);

    let fatal = ErrorInfo::new(40000, 400, "bad request");
    network
        .last()
        .receive(ProtocolMessage::new(Action::Error).with_error(fatal.clone()));
    wait_for_state(&client, ConnectionState::Failed).await;

    assert_eq!(outcome.await.unwrap().unwrap_err(), fatal);
    assert_eq!(channel.state(), ChannelState::Failed);
    assert_eq!(channel.error_reason(), Some(fatal.clone()));
    assert_eq!(client.connection().error_reason(), Some(fatal));

    // A failed connection can be restarted, but without resuming
    client.connect().unwrap();
    wait_for_state(&client, ConnectionState::Connected).await;
    assert_eq!(client.connection().id().as_deref(), Some("conn-2"));
    assert!(network.last().params().resume.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_server_disconnect_resumes_immediately() {
    let network = FakeNetwork::cooperative();
    let client = test_client(&network);
    wait_for_state(&client, ConnectionState::Connected).await;

    let mut changes = client.connection().on_state_change();
    network.last().receive(
        ProtocolMessage::new(Action::Disconnected).with_error(ErrorInfo::disconnected("going away")),
    );
    wait_for_state(&client, ConnectionState::Disconnected).await;
    wait_for_state(&client, ConnectionState::Connected).await;

    let disconnected = changes
        .drain()
        .into_iter()
        .find(|c| c.current == ConnectionState::Disconnected)
        .unwrap();
    assert_eq!(disconnected.retry_in, Some(Duration::ZERO));

    assert_eq!(network.attempts(), 2);
    assert_eq!(
        network.last().params().resume,
        Some(ResumeToken {
            connection_key: "key-conn-1".into(),
            connection_serial: None,
        })
    );
    assert_eq!(client.connection().id().as_deref(), Some("conn-1"));
    assert_eq!(client.metrics().await.reconnect_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_recover_option_used_for_first_attempt() {
    let network = FakeNetwork::new(Script {
        resume: false,
        ..Script::cooperative()
    });
    let options = ClientOptions {
        recover: Some("key-old:7".into()),
        ..test_options()
    };
    let client = client_with(&network, options);
    wait_for_state(&client, ConnectionState::Connected).await;

    let params = network.last().params().clone();
    assert_eq!(params.recover.as_deref(), Some("key-old:7"));
    let pairs = params.query_pairs();
    assert!(pairs.contains(&("recover", "key-old".to_string())));
    assert!(pairs.contains(&("connection_serial", "7".to_string())));

    network.last().drop_connection(None);
    wait_for_state(&client, ConnectionState::Disconnected).await;
    wait_for_state(&client, ConnectionState::Connected).await;
    let params = network.last().params().clone();
    assert!(params.recover.is_none());
    assert!(params.resume.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_inbound_serial_advances_recovery_key() {
    let network = FakeNetwork::cooperative();
    let client = test_client(&network);
    wait_for_state(&client, ConnectionState::Connected).await;

    let channel = client.channel("news");
    channel.attach().await.unwrap();

    let mut message = ProtocolMessage::messages("news", vec![Message::new("headline", "hi")]);
    message.connection_serial = Some(5);
    network.last().receive(message);
    settle().await;

    assert_eq!(client.connection().serial(), Some(5));
    assert_eq!(client.connection().recovery_key().as_deref(), Some("key-conn-1:5"));
}

#[tokio::test(start_paused = true)]
async fn test_metrics_snapshot() {
    let network = FakeNetwork::cooperative();
    let client = test_client(&network);
    wait_for_state(&client, ConnectionState::Connected).await;

    let channel = client.channel("stats");
    channel.publish("tick", 1).await.unwrap();

    let metrics = client.metrics().await;
    assert_eq!(metrics.connection_state, ConnectionState::Connected);
    // Attach + Message out; Connected + Attached + Ack in
    assert_eq!(metrics.messages_sent, 2);
    assert_eq!(metrics.messages_received, 3);
    assert_eq!(metrics.pending_acks, 0);
    assert_eq!(metrics.queued_messages, 0);
    assert_eq!(metrics.reconnect_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_fails_outstanding_work() {
    let network = FakeNetwork::cooperative();
    let client = test_client(&network);
    wait_for_state(&client, ConnectionState::Connected).await;
    network.update(|script| script.respond = false);

    let channel = client.channel("pending");
    let attach = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.attach().await })
    };
    settle().await;

    client.shutdown().await.unwrap();
    assert!(attach.await.unwrap().is_err());
    assert_eq!(channel.state(), ChannelState::Detached);
}
