use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use pretty_assertions::assert_eq;

use crate::{
    bson::doc,
    cmap::RawCommandResponse,
    error::{CommandError, Error, ErrorKind},
    options::{ClientOptions, ServerAddress},
    runtime,
    sdam::{HandshakePhase, ServerDescription, ServerType, Topology, TopologyType},
    selection_criteria::{ReadPreference, SelectionCriteria},
    test::util::{standalone_hello, MockServer},
};

fn primary_criteria() -> SelectionCriteria {
    SelectionCriteria::ReadPreference(ReadPreference::Primary)
}

fn available_description(address: &ServerAddress, hello: crate::bson::Document) -> ServerDescription {
    description_with_rtt(address, hello, Duration::from_millis(1))
}

fn description_with_rtt(
    address: &ServerAddress,
    hello: crate::bson::Document,
    rtt: Duration,
) -> ServerDescription {
    let reply = RawCommandResponse::with_document_and_address(address.clone(), hello)
        .unwrap()
        .into_hello_reply()
        .unwrap();
    ServerDescription::new_from_hello_reply(address.clone(), reply, rtt)
}

fn mongos_hello() -> crate::bson::Document {
    doc! {
        "ok": 1,
        "isWritablePrimary": true,
        "msg": "isdbgrid",
        "minWireVersion": 0,
        "maxWireVersion": 21,
    }
}

fn rs_primary_hello(hosts: &[&str]) -> crate::bson::Document {
    doc! {
        "ok": 1,
        "isWritablePrimary": true,
        "setName": "rs",
        "hosts": hosts,
        "minWireVersion": 0,
        "maxWireVersion": 21,
    }
}

fn command_error(code: i32) -> Error {
    ErrorKind::Command(CommandError {
        code,
        code_name: String::new(),
        message: "injected".to_string(),
        labels: Vec::new(),
    })
    .into()
}

fn after_completion(generation: u32) -> HandshakePhase {
    HandshakePhase::AfterCompletion {
        generation,
        max_wire_version: 21,
    }
}

async fn wait_for_server_type(
    topology: &Topology,
    address: &ServerAddress,
    server_type: ServerType,
) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let description = topology.description();
        if description
            .get_server_description(address)
            .map(|sd| sd.server_type == server_type)
            .unwrap_or(false)
        {
            return true;
        }
        topology.request_update();
        runtime::delay_for(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn discovers_standalone() {
    let server = MockServer::start().await;
    let topology = Topology::new(ClientOptions::for_test(vec![server.address().clone()])).unwrap();

    let selected = topology.select_server(&primary_criteria()).await.unwrap();
    assert_eq!(selected.address(), server.address());
    assert_eq!(topology.topology_type(), TopologyType::Single);

    let description = topology.description();
    let server_description = description.get_server_description(server.address()).unwrap();
    assert_eq!(server_description.server_type, ServerType::Standalone);
    assert!(server_description.average_round_trip_time.is_some());
}

#[tokio::test]
async fn selection_times_out_without_suitable_server() {
    let server = MockServer::start().await;
    server.refuse_hellos(true);

    let mut options = ClientOptions::for_test(vec![server.address().clone()]);
    options.server_selection_timeout = Some(Duration::from_millis(300));
    let topology = Topology::new(options).unwrap();

    let start = Instant::now();
    let error = topology
        .select_server(&primary_criteria())
        .await
        .unwrap_err();
    assert!(error.is_server_selection_error(), "{}", error);
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn selection_waits_for_server_to_become_available() {
    let server = MockServer::start().await;
    server.refuse_hellos(true);

    let mut options = ClientOptions::for_test(vec![server.address().clone()]);
    options.server_selection_timeout = Some(Duration::from_secs(5));
    let topology = Arc::new(Topology::new(options).unwrap());

    let selecting = topology.clone();
    let selection =
        runtime::spawn(async move { selecting.select_server(&primary_criteria()).await.is_ok() });

    runtime::delay_for(Duration::from_millis(200)).await;
    server.refuse_hellos(false);

    assert!(selection.await);
}

#[tokio::test]
async fn failed_check_marks_server_unknown() {
    let server = MockServer::start().await;
    let topology = Topology::new(ClientOptions::for_test(vec![server.address().clone()])).unwrap();
    topology.select_server(&primary_criteria()).await.unwrap();

    server.refuse_hellos(true);
    assert!(wait_for_server_type(&topology, server.address(), ServerType::Unknown).await);

    let description = topology.description();
    let server_description = description.get_server_description(server.address()).unwrap();
    assert!(server_description.error().is_some());
    assert_eq!(server_description.average_round_trip_time, None);

    server.refuse_hellos(false);
    assert!(wait_for_server_type(&topology, server.address(), ServerType::Standalone).await);
}

#[tokio::test]
async fn network_error_clears_pool() {
    let address = ServerAddress::parse("a:27017").unwrap();
    let topology = Topology::new_unmonitored(ClientOptions::for_test(vec![address.clone()])).unwrap();
    let updater = topology.updater();

    assert!(updater.update(available_description(&address, standalone_hello())).await);
    let server = topology.servers().get(&address).unwrap().clone();
    assert_eq!(server.pool.generation(), 0);

    let error: Error = std::io::ErrorKind::ConnectionReset.into();
    assert!(
        topology
            .handle_application_error(address.clone(), error.clone(), after_completion(0))
            .await
    );
    assert_eq!(server.pool.generation(), 1);
    assert_eq!(
        topology.description().get_server_description(&address).unwrap().server_type,
        ServerType::Unknown
    );

    // An error from a connection that predates the clear is ignored.
    assert!(updater.update(available_description(&address, standalone_hello())).await);
    assert!(
        !topology
            .handle_application_error(address.clone(), error, after_completion(0))
            .await
    );
    assert_eq!(server.pool.generation(), 1);
    assert_eq!(
        topology.description().get_server_description(&address).unwrap().server_type,
        ServerType::Standalone
    );
}

#[tokio::test]
async fn network_timeout_after_handshake_is_ignored() {
    let address = ServerAddress::parse("a:27017").unwrap();
    let topology = Topology::new_unmonitored(ClientOptions::for_test(vec![address.clone()])).unwrap();
    topology
        .updater()
        .update(available_description(&address, standalone_hello()))
        .await;

    let timeout: Error = std::io::ErrorKind::TimedOut.into();
    assert!(
        !topology
            .handle_application_error(address.clone(), timeout.clone(), after_completion(0))
            .await
    );

    assert!(
        topology
            .handle_application_error(address, timeout, HandshakePhase::PreHello { generation: 0 })
            .await
    );
}

#[tokio::test]
async fn state_change_errors_mark_unknown() {
    let address = ServerAddress::parse("a:27017").unwrap();
    let topology = Topology::new_unmonitored(ClientOptions::for_test(vec![address.clone()])).unwrap();
    let updater = topology.updater();
    let server_type = |topology: &Topology| {
        topology
            .description()
            .get_server_description(&address)
            .unwrap()
            .server_type
    };

    updater
        .update(available_description(&address, standalone_hello()))
        .await;
    let server = topology.servers().get(&address).unwrap().clone();

    // NotWritablePrimary: the server is rechecked but its pool survives.
    assert!(
        topology
            .handle_application_error(address.clone(), command_error(10107), after_completion(0))
            .await
    );
    assert_eq!(server_type(&topology), ServerType::Unknown);
    assert_eq!(server.pool.generation(), 0);

    // ShutdownInProgress: the pool is cleared as well.
    updater
        .update(available_description(&address, standalone_hello()))
        .await;
    assert!(
        topology
            .handle_application_error(address.clone(), command_error(91), after_completion(0))
            .await
    );
    assert_eq!(server_type(&topology), ServerType::Unknown);
    assert_eq!(server.pool.generation(), 1);

    // Other command errors leave the topology alone.
    updater
        .update(available_description(&address, standalone_hello()))
        .await;
    assert!(
        !topology
            .handle_application_error(address.clone(), command_error(2), after_completion(1))
            .await
    );
    assert_eq!(server_type(&topology), ServerType::Standalone);
}

#[tokio::test]
async fn mark_primary_stale_forgets_primary() {
    let a = ServerAddress::parse("a:27017").unwrap();
    let b = ServerAddress::parse("b:27017").unwrap();
    let topology = Topology::new_unmonitored(ClientOptions::for_test(vec![a.clone()])).unwrap();

    topology
        .updater()
        .update(available_description(&a, rs_primary_hello(&["a:27017", "b:27017"])))
        .await;
    assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
    assert_eq!(topology.servers().len(), 2);

    // Only the current primary can be marked stale.
    assert!(!topology.mark_primary_stale(b).await);

    assert!(topology.mark_primary_stale(a.clone()).await);
    assert_eq!(topology.topology_type(), TopologyType::ReplicaSetNoPrimary);
    assert_eq!(
        topology.description().get_server_description(&a).unwrap().server_type,
        ServerType::Unknown
    );
}

#[tokio::test]
async fn servers_follow_description() {
    let a = ServerAddress::parse("a:27017").unwrap();
    let topology = Topology::new_unmonitored(ClientOptions::for_test(vec![
        a.clone(),
        ServerAddress::parse("gone:27017").unwrap(),
    ]))
    .unwrap();
    assert_eq!(topology.servers().len(), 2);

    topology
        .updater()
        .update(available_description(&a, rs_primary_hello(&["a:27017", "c:27017"])))
        .await;

    let mut addresses: Vec<_> = topology.servers().keys().map(|a| a.to_string()).collect();
    addresses.sort();
    assert_eq!(addresses, vec!["a:27017", "c:27017"]);
}

#[tokio::test]
async fn watcher_sees_updates() {
    let a = ServerAddress::parse("a:27017").unwrap();
    let topology = Topology::new_unmonitored(ClientOptions::for_test(vec![a.clone()])).unwrap();
    let mut watcher = topology.watch();

    let updater = topology.updater();
    runtime::execute(async move {
        updater
            .update(available_description(&a, standalone_hello()))
            .await;
    });

    assert!(watcher.wait_for_update(Duration::from_secs(5)).await);
    assert_eq!(
        watcher.observe_latest().description.topology_type(),
        TopologyType::Single
    );
}

#[tokio::test]
async fn shutdown_stops_selection() {
    let server = MockServer::start().await;
    let topology = Topology::new(ClientOptions::for_test(vec![server.address().clone()])).unwrap();
    topology.select_server(&primary_criteria()).await.unwrap();

    topology.shutdown().await;

    assert!(topology.servers().is_empty());
    let error = topology
        .select_server(&primary_criteria())
        .await
        .unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Shutdown), "{}", error);
}

#[tokio::test]
async fn round_trip_time_changes_are_published() {
    let a = ServerAddress::parse("a:27017").unwrap();
    let b = ServerAddress::parse("b:27017").unwrap();
    let topology =
        Topology::new_unmonitored(ClientOptions::for_test(vec![a.clone(), b.clone()])).unwrap();
    let updater = topology.updater();

    assert!(updater.update(available_description(&a, mongos_hello())).await);
    assert!(updater.update(available_description(&b, mongos_hello())).await);
    assert_eq!(topology.topology_type(), TopologyType::Sharded);

    // Same hello reply, slower server.
    assert!(
        updater
            .update(description_with_rtt(&a, mongos_hello(), Duration::from_millis(500)))
            .await
    );
    assert_eq!(
        topology
            .description()
            .get_server_description(&a)
            .unwrap()
            .average_round_trip_time,
        Some(Duration::from_millis(500))
    );

    for _ in 0..20 {
        let selected = topology
            .select_server_within(&primary_criteria(), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(selected.address(), &b);
    }

    // Nothing new to publish.
    assert!(
        !updater
            .update(description_with_rtt(&a, mongos_hello(), Duration::from_millis(500)))
            .await
    );
}

#[tokio::test]
async fn repeated_check_failures_are_published() {
    let address = ServerAddress::parse("a:27017").unwrap();
    let topology =
        Topology::new_unmonitored(ClientOptions::for_test(vec![address.clone()])).unwrap();
    let updater = topology.updater();
    let mut watcher = topology.watch();

    let failure = || {
        ServerDescription::new_from_error(
            address.clone(),
            std::io::ErrorKind::ConnectionRefused.into(),
        )
    };
    assert!(updater.update(failure()).await);
    watcher.observe_latest();
    assert!(updater.update(failure()).await);
    assert!(watcher.wait_for_update(Duration::from_secs(1)).await);
}
