//! Failover behaviour against the in-memory mock network.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use url::Url;
use wirelink_core::{
    command::{ConnectionControl, ConnectionInfo, ConsumerInfo, ObjectId, ProducerInfo, RemoveInfo, SessionInfo},
    config::FailoverConfig,
    telemetry::init_test_logging,
    types::{ConnectionId, ConsumerId, Destination, ProducerId, SessionId},
    Command, CommandKind, Error,
};
use wirelink_transport::{
    FailoverTransport, MockNetwork, Transport, TransportFactory, TransportListener, TransportState,
};

const WAIT: Duration = Duration::from_secs(2);

// ================================================================================================
// Fixtures
// ================================================================================================

#[derive(Default)]
struct RecordingListener {
    commands: Mutex<Vec<Command>>,
    errors: Mutex<Vec<Error>>,
    interruptions: Mutex<u32>,
    resumptions: Mutex<u32>,
}

#[async_trait]
impl TransportListener for RecordingListener {
    async fn on_command(&self, command: Command) {
        self.commands.lock().push(command);
    }

    async fn on_exception(&self, error: Error) {
        self.errors.lock().push(error);
    }

    async fn transport_interrupted(&self) {
        *self.interruptions.lock() += 1;
    }

    async fn transport_resumed(&self) {
        *self.resumptions.lock() += 1;
    }
}

fn uri(host: &str) -> Url {
    Url::parse(&format!("mock://{host}")).unwrap()
}

fn sequential() -> FailoverConfig {
    FailoverConfig {
        randomize: false,
        initial_reconnect_delay: Duration::from_millis(1),
        max_reconnect_delay: Duration::from_millis(5),
        ..FailoverConfig::default()
    }
}

fn network(hosts: &[&str]) -> MockNetwork {
    let network = MockNetwork::new();
    for host in hosts {
        network.register_host(host);
    }
    network
}

fn failover(network: &MockNetwork, hosts: &[&str], config: FailoverConfig) -> Arc<FailoverTransport> {
    FailoverTransport::new(
        hosts.iter().map(|host| uri(host)).collect(),
        config,
        TransportFactory::with_mock_network(network.clone()),
    )
}

async fn wait_for_state(transport: &FailoverTransport, wanted: TransportState) {
    let mut status = transport.subscribe_state();
    tokio::time::timeout(WAIT, status.wait_for(|state| *state == wanted))
        .await
        .expect("state not reached in time")
        .expect("status channel closed");
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn connected_to(transport: &FailoverTransport, host: &str) {
    let wanted = uri(host);
    wait_until(|| transport.connected_uri().as_ref() == Some(&wanted)).await;
}

struct Ids {
    connection: ConnectionId,
    session: SessionId,
    consumer: ConsumerId,
    producer: ProducerId,
}

fn ids() -> Ids {
    let connection = ConnectionId::new("conn-1");
    let session = SessionId::new(connection.clone(), 1);
    let consumer = ConsumerId::new(session.clone(), 1);
    let producer = ProducerId::new(session.clone(), 1);
    Ids { connection, session, consumer, producer }
}

fn connection_info(ids: &Ids) -> Command {
    Command::new(CommandKind::ConnectionInfo(ConnectionInfo {
        connection_id: ids.connection.clone(),
        client_id: "client".to_string(),
        user_name: None,
        fault_tolerant: true,
    }))
}

fn session_info(ids: &Ids) -> Command {
    Command::new(CommandKind::SessionInfo(SessionInfo { session_id: ids.session.clone() }))
}

fn consumer_info(ids: &Ids) -> Command {
    Command::new(CommandKind::ConsumerInfo(ConsumerInfo::new(ids.consumer.clone(), Destination::queue("orders"), 10)))
}

fn producer_info(ids: &Ids) -> Command {
    Command::new(CommandKind::ProducerInfo(ProducerInfo { producer_id: ids.producer.clone(), destination: None }))
}

fn names(commands: &[Command]) -> Vec<&'static str> {
    commands.iter().map(Command::name).collect()
}

// ================================================================================================
// Replay
// ================================================================================================

#[tokio::test]
async fn test_replay_recreates_state_in_creation_order() -> Result<()> {
    init_test_logging();
    let network = network(&["a", "b"]);
    let transport = failover(&network, &["a", "b"], sequential());
    transport.start().await?;
    wait_for_state(&transport, TransportState::Connected).await;

    let ids = ids();
    transport.oneway(connection_info(&ids)).await?;
    transport.oneway(session_info(&ids)).await?;
    transport.oneway(consumer_info(&ids)).await?;
    transport.oneway(producer_info(&ids)).await?;
    transport
        .oneway(Command::new(CommandKind::RemoveInfo(RemoveInfo {
            object_id: ObjectId::Producer(ids.producer.clone()),
        })))
        .await?;

    network.kill_host("a").await;
    connected_to(&transport, "b").await;

    let replayed = network.last_transport("b").unwrap().sent_commands();
    assert_eq!(names(&replayed), vec!["ConnectionInfo", "SessionInfo", "ConsumerInfo"]);

    transport.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_listener_sees_interruption_and_resumption() -> Result<()> {
    let network = network(&["a", "b"]);
    let transport = failover(&network, &["a", "b"], sequential());
    let listener = Arc::new(RecordingListener::default());
    transport.set_listener(listener.clone());
    transport.start().await?;
    wait_for_state(&transport, TransportState::Connected).await;
    assert_eq!(*listener.resumptions.lock(), 0);

    network.kill_host("a").await;
    connected_to(&transport, "b").await;

    assert_eq!(*listener.interruptions.lock(), 1);
    wait_until(|| *listener.resumptions.lock() == 1).await;
    assert!(listener.errors.lock().is_empty());

    transport.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_stale_transport_failure_is_ignored() -> Result<()> {
    let network = network(&["a", "b"]);
    let transport = failover(&network, &["a", "b"], sequential());
    let listener = Arc::new(RecordingListener::default());
    transport.set_listener(listener.clone());
    transport.start().await?;
    wait_for_state(&transport, TransportState::Connected).await;

    let old = network.last_transport("a").unwrap();
    network.kill_host("a").await;
    connected_to(&transport, "b").await;

    // Late traffic from the replaced transport changes nothing.
    old.inject_command(Command::new(CommandKind::KeepAliveInfo)).await;
    old.fail(Error::io("late reset")).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.connected_uri(), Some(uri("b")));
    assert_eq!(network.transports_for("b").len(), 1);
    assert!(listener.commands.lock().is_empty());
    assert_eq!(*listener.interruptions.lock(), 1);

    transport.close().await?;
    Ok(())
}

// ================================================================================================
// Candidate selection
// ================================================================================================

#[tokio::test]
async fn test_round_robin_after_failure() -> Result<()> {
    let network = network(&["a", "b", "c"]);
    network.set_host_up("b", false);
    network.set_host_up("c", false);
    // Slow enough backoff that "a" comes back before it is retried.
    let config = FailoverConfig {
        initial_reconnect_delay: Duration::from_millis(50),
        max_reconnect_delay: Duration::from_millis(100),
        ..sequential()
    };
    let transport = failover(&network, &["a", "b", "c"], config);
    transport.start().await?;
    wait_for_state(&transport, TransportState::Connected).await;

    network.kill_host("a").await;
    wait_until(|| network.attempts_to("c") == 1).await;
    network.set_host_up("a", true);
    connected_to(&transport, "a").await;

    assert_eq!(network.connect_attempts(), vec!["a", "b", "c", "a"]);
    transport.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_backup_is_consumed_without_new_connect() -> Result<()> {
    init_test_logging();
    let network = network(&["a", "b"]);
    let config = FailoverConfig { backup: true, backup_pool_size: 1, ..sequential() };
    let transport = failover(&network, &["a", "b"], config);
    transport.start().await?;
    wait_for_state(&transport, TransportState::Connected).await;
    wait_until(|| transport.backup_pool().len() == 1).await;

    let ids = ids();
    transport.oneway(connection_info(&ids)).await?;
    transport.oneway(session_info(&ids)).await?;

    network.kill_host("a").await;
    connected_to(&transport, "b").await;

    assert_eq!(network.attempts_to("b"), 1);
    assert_eq!(network.transports_for("b").len(), 1);
    let replayed = network.last_transport("b").unwrap().sent_commands();
    assert_eq!(names(&replayed), vec!["ConnectionInfo", "SessionInfo"]);

    transport.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_broker_directed_reconnect() -> Result<()> {
    let network = network(&["a", "b", "z"]);
    let transport = failover(&network, &["a", "b"], sequential());
    transport.start().await?;
    wait_for_state(&transport, TransportState::Connected).await;

    let control = ConnectionControl { reconnect_to: "mock://z".to_string(), ..ConnectionControl::default() };
    network
        .last_transport("a")
        .unwrap()
        .inject_command(Command::new(CommandKind::ConnectionControl(control)))
        .await;

    connected_to(&transport, "z").await;
    assert!(transport.uri_pool().contains(&uri("z")));
    transport.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_broker_uri_update_without_rebalance_keeps_connection() -> Result<()> {
    let network = network(&["a", "b", "c"]);
    let transport = failover(&network, &["a"], sequential());
    transport.start().await?;
    wait_for_state(&transport, TransportState::Connected).await;

    let control = ConnectionControl { connected_brokers: "mock://b,mock://c".to_string(), ..ConnectionControl::default() };
    network
        .last_transport("a")
        .unwrap()
        .inject_command(Command::new(CommandKind::ConnectionControl(control)))
        .await;

    assert_eq!(transport.uri_pool().uris(), vec![uri("a"), uri("b"), uri("c")]);
    assert_eq!(transport.connected_uri(), Some(uri("a")));
    transport.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_broker_directed_reconnect_can_be_disabled() -> Result<()> {
    let network = network(&["a", "z"]);
    let config = FailoverConfig { reconnect_supported: false, ..sequential() };
    let transport = failover(&network, &["a"], config);
    transport.start().await?;
    wait_for_state(&transport, TransportState::Connected).await;

    let control = ConnectionControl { reconnect_to: "mock://z".to_string(), ..ConnectionControl::default() };
    network
        .last_transport("a")
        .unwrap()
        .inject_command(Command::new(CommandKind::ConnectionControl(control)))
        .await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.connected_uri(), Some(uri("a")));
    assert_eq!(network.attempts_to("z"), 0);
    transport.close().await?;
    Ok(())
}

// ================================================================================================
// Blocking senders
// ================================================================================================

#[tokio::test]
async fn test_blocked_send_is_released_after_reconnect() -> Result<()> {
    let network = network(&["a"]);
    let transport = failover(&network, &["a"], sequential());
    transport.start().await?;
    wait_for_state(&transport, TransportState::Connected).await;

    network.kill_host("a").await;
    assert!(!transport.is_connected());

    let sender = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move { transport.oneway(Command::new(CommandKind::KeepAliveInfo)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!sender.is_finished());

    network.set_host_up("a", true);
    tokio::time::timeout(WAIT, sender).await??.map_err(anyhow::Error::from)?;

    let sent = network.last_transport("a").unwrap().sent_commands();
    assert_eq!(names(&sent), vec!["KeepAliveInfo"]);
    transport.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_blocked_senders_resume_in_arrival_order() -> Result<()> {
    let network = network(&["a"]);
    let transport = failover(&network, &["a"], sequential());
    transport.start().await?;
    wait_for_state(&transport, TransportState::Connected).await;
    network.kill_host("a").await;

    let mut senders = Vec::new();
    for id in 1..=3u32 {
        let transport = Arc::clone(&transport);
        senders.push(tokio::spawn(async move {
            transport.oneway(Command::new(CommandKind::KeepAliveInfo).with_command_id(id)).await
        }));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    network.set_host_up("a", true);
    for sender in senders {
        tokio::time::timeout(WAIT, sender).await??.map_err(anyhow::Error::from)?;
    }

    let ids: Vec<u32> =
        network.last_transport("a").unwrap().sent_commands().iter().map(|command| command.command_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    transport.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_send_times_out_when_timeout_configured() -> Result<()> {
    let network = network(&["a"]);
    let config = FailoverConfig { timeout: Some(Duration::from_millis(50)), ..sequential() };
    let transport = failover(&network, &["a"], config);
    transport.start().await?;
    wait_for_state(&transport, TransportState::Connected).await;
    network.kill_host("a").await;

    let started = Instant::now();
    let err = transport.oneway(Command::new(CommandKind::KeepAliveInfo)).await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    assert!(started.elapsed() >= Duration::from_millis(50));

    transport.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_close_releases_blocked_senders() -> Result<()> {
    let network = network(&["a"]);
    let transport = failover(&network, &["a"], sequential());
    transport.start().await?;
    wait_for_state(&transport, TransportState::Connected).await;
    network.kill_host("a").await;

    let sender = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move { transport.oneway(Command::new(CommandKind::KeepAliveInfo)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    transport.close().await?;

    let outcome = tokio::time::timeout(WAIT, sender).await??;
    assert!(matches!(outcome, Err(Error::TransportClosed { .. })));
    assert!(transport.oneway(Command::new(CommandKind::KeepAliveInfo)).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_removal_while_disconnected_does_not_block() -> Result<()> {
    let network = network(&["a"]);
    let transport = failover(&network, &["a"], sequential());
    transport.start().await?;
    wait_for_state(&transport, TransportState::Connected).await;

    let ids = ids();
    transport.oneway(connection_info(&ids)).await?;
    transport.oneway(session_info(&ids)).await?;
    network.kill_host("a").await;

    let removal = Command::new(CommandKind::RemoveInfo(RemoveInfo { object_id: ObjectId::Session(ids.session.clone()) }));
    tokio::time::timeout(Duration::from_millis(100), transport.oneway(removal)).await??;

    network.set_host_up("a", true);
    wait_for_state(&transport, TransportState::Connected).await;
    let replayed = network.last_transport("a").unwrap().sent_commands();
    assert_eq!(names(&replayed), vec!["ConnectionInfo"]);

    transport.close().await?;
    Ok(())
}

// ================================================================================================
// Requests
// ================================================================================================

#[tokio::test]
async fn test_request_round_trip() -> Result<()> {
    let network = network(&["a"]);
    let transport = failover(&network, &["a"], sequential());
    transport.start().await?;

    let response = transport.request(Command::new(CommandKind::KeepAliveInfo), Some(WAIT)).await?;
    assert!(response.is_response());
    assert!(transport.state_tracker().is_empty());
    transport.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_unanswered_request_is_reissued_after_reconnect() -> Result<()> {
    let network = network(&["a", "b"]);
    network.set_auto_respond("a", false);
    let transport = failover(&network, &["a", "b"], sequential());
    transport.start().await?;
    wait_for_state(&transport, TransportState::Connected).await;

    let request = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move { transport.request(Command::new(CommandKind::KeepAliveInfo), Some(WAIT)).await })
    };
    wait_until(|| network.last_transport("a").is_some_and(|t| !t.sent_commands().is_empty())).await;

    network.kill_host("a").await;
    let response = tokio::time::timeout(WAIT, request).await??.map_err(anyhow::Error::from)?;
    assert!(response.is_response());

    let reissued = network.last_transport("b").unwrap().sent_commands();
    assert_eq!(names(&reissued), vec!["KeepAliveInfo"]);
    transport.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_tracked_request_is_replayed_not_reissued() -> Result<()> {
    let network = network(&["a", "b"]);
    network.set_auto_respond("a", false);
    let transport = failover(&network, &["a", "b"], sequential());
    transport.start().await?;
    wait_for_state(&transport, TransportState::Connected).await;

    let ids = ids();
    let request = {
        let transport = Arc::clone(&transport);
        let command = connection_info(&ids);
        tokio::spawn(async move { transport.request(command, Some(WAIT)).await })
    };
    wait_until(|| network.last_transport("a").is_some_and(|t| !t.sent_commands().is_empty())).await;

    network.kill_host("a").await;
    tokio::time::timeout(WAIT, request).await??.map_err(anyhow::Error::from)?;

    let sent = network.last_transport("b").unwrap().sent_commands();
    assert_eq!(names(&sent), vec!["ConnectionInfo"]);
    transport.close().await?;
    Ok(())
}

// ================================================================================================
// Shutdown and attempt limits
// ================================================================================================

#[tokio::test]
async fn test_startup_attempt_limit_is_fatal() -> Result<()> {
    let network = network(&["a", "b"]);
    network.set_host_up("a", false);
    network.set_host_up("b", false);
    let config = FailoverConfig { startup_max_reconnect_attempts: Some(2), ..sequential() };
    let transport = failover(&network, &["a", "b"], config);

    let err = tokio::time::timeout(WAIT, transport.start()).await?.unwrap_err();
    assert!(matches!(err, Error::StartupFailed { attempts: 3, .. }));
    assert_eq!(network.connect_attempts().len(), 3);
    assert_eq!(transport.state(), TransportState::Closed);
    assert!(matches!(
        transport.oneway(Command::new(CommandKind::KeepAliveInfo)).await,
        Err(Error::StartupFailed { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_reconnect_attempt_limit_closes_transport() -> Result<()> {
    let network = network(&["a"]);
    let config = FailoverConfig { max_reconnect_attempts: Some(1), ..sequential() };
    let transport = failover(&network, &["a"], config);
    let listener = Arc::new(RecordingListener::default());
    transport.set_listener(listener.clone());
    transport.start().await?;

    network.kill_host("a").await;
    wait_for_state(&transport, TransportState::Closed).await;

    let errors = listener.errors.lock().clone();
    assert!(matches!(errors.as_slice(), [Error::ConnectionFailed { attempts: 2, .. }]));
    Ok(())
}

#[tokio::test]
async fn test_broker_shutdown_closes_instead_of_reconnecting() -> Result<()> {
    let network = network(&["a", "b"]);
    let transport = failover(&network, &["a", "b"], sequential());
    let listener = Arc::new(RecordingListener::default());
    transport.set_listener(listener.clone());
    transport.start().await?;
    wait_for_state(&transport, TransportState::Connected).await;

    network.last_transport("a").unwrap().inject_command(Command::new(CommandKind::ShutdownInfo)).await;
    wait_for_state(&transport, TransportState::Closed).await;

    assert_eq!(network.attempts_to("b"), 0);
    assert_eq!(listener.errors.lock().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_inbound_commands_reach_listener() -> Result<()> {
    let network = network(&["a"]);
    let transport = failover(&network, &["a"], sequential());
    let listener = Arc::new(RecordingListener::default());
    transport.set_listener(listener.clone());
    transport.start().await?;
    wait_for_state(&transport, TransportState::Connected).await;

    network.last_transport("a").unwrap().inject_command(Command::new(CommandKind::KeepAliveInfo)).await;
    assert_eq!(names(&listener.commands.lock()), vec!["KeepAliveInfo"]);
    transport.close().await?;
    Ok(())
}

proptest! {
    #[test]
    fn prop_backoff_is_monotonic_and_capped(
        initial_ms in 1u64..500,
        multiplier in 1.0f64..4.0,
        max_ms in 500u64..60_000,
        failures in 0u32..64,
    ) {
        let config = FailoverConfig {
            initial_reconnect_delay: Duration::from_millis(initial_ms),
            max_reconnect_delay: Duration::from_millis(max_ms),
            backoff_multiplier: multiplier,
            ..FailoverConfig::default()
        };
        let current = config.reconnect_delay_for(failures);
        let next = config.reconnect_delay_for(failures + 1);
        prop_assert!(current <= next);
        prop_assert!(next <= config.max_reconnect_delay);
    }
}
