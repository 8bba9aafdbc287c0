use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use futures_util::future::BoxFuture;
use pretty_assertions::assert_eq;

use super::{handshake::HandshakerOptions, ConnectionEstablisher, EstablisherOptions};
use crate::{
    bson::doc,
    client::auth::{AuthConnection, Authenticator, Credential},
    cmap::conn::PendingConnection,
    error::{Error, Result},
    sdam::{HandshakePhase, ServerType},
    test::util::{MockReply, MockServer},
};

/// Records every username it is asked to authenticate and runs a single command.
#[derive(Default)]
struct RecordingAuthenticator {
    usernames: Mutex<Vec<String>>,
}

impl Authenticator for RecordingAuthenticator {
    fn authenticate<'a>(
        &'a self,
        mut conn: AuthConnection<'a>,
        credential: &'a Credential,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.usernames
                .lock()
                .unwrap()
                .push(credential.username.clone().unwrap_or_default());
            conn.run_command("admin", doc! { "saslStart": 1 }).await?;
            Ok(())
        })
    }
}

/// Fails every conversation without contacting the server.
struct RejectingAuthenticator;

impl Authenticator for RejectingAuthenticator {
    fn authenticate<'a>(
        &'a self,
        _conn: AuthConnection<'a>,
        _credential: &'a Credential,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Err(Error::authentication_error("TEST", "credential rejected")) })
    }
}

fn establisher(authenticator: Option<Arc<dyn Authenticator>>) -> ConnectionEstablisher {
    let options = EstablisherOptions {
        handshake_options: HandshakerOptions {
            app_name: Some("establish-test".to_string()),
            authenticator,
        },
        ..Default::default()
    };
    ConnectionEstablisher::new(options).unwrap()
}

fn pending(server: &MockServer, generation: u32) -> PendingConnection {
    PendingConnection {
        id: 1,
        address: server.address().clone(),
        generation,
        time_created: Instant::now(),
    }
}

fn credential() -> Credential {
    Credential::builder().username("alice".to_string()).build()
}

#[tokio::test]
async fn handshake_caches_stream_description() {
    let server = MockServer::start().await;
    let connection = establisher(None)
        .establish_connection(pending(&server, 3), None)
        .await
        .unwrap();

    assert_eq!(connection.generation, 3);
    let description = connection.stream_description().unwrap();
    assert_eq!(description.max_wire_version, Some(21));
    assert_eq!(description.initial_server_type, ServerType::Standalone);
    assert_eq!(&description.server_address, server.address());

    let hellos = server.received("isMaster");
    assert_eq!(hellos.len(), 1);
    let app_name = hellos[0]
        .get_document("client")
        .unwrap()
        .get_document("application")
        .unwrap()
        .get_str("name")
        .unwrap();
    assert_eq!(app_name, "establish-test");
}

#[tokio::test]
async fn authenticator_runs_after_hello() {
    let server = MockServer::start().await;
    let authenticator = Arc::new(RecordingAuthenticator::default());

    establisher(Some(authenticator.clone()))
        .establish_connection(pending(&server, 0), Some(&credential()))
        .await
        .unwrap();

    assert_eq!(*authenticator.usernames.lock().unwrap(), vec!["alice"]);
    let commands = server.received("saslStart");
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].get_str("$db").unwrap(), "admin");
}

#[tokio::test]
async fn authenticator_is_skipped_without_credential() {
    let server = MockServer::start().await;
    let authenticator = Arc::new(RecordingAuthenticator::default());

    establisher(Some(authenticator.clone()))
        .establish_connection(pending(&server, 0), None)
        .await
        .unwrap();

    assert!(authenticator.usernames.lock().unwrap().is_empty());
    assert!(server.received("saslStart").is_empty());
}

#[tokio::test]
async fn authentication_failure_is_post_hello() {
    let server = MockServer::start().await;
    server.push_reply(
        "saslStart",
        MockReply::Document(doc! { "ok": 0, "code": 18, "errmsg": "auth failed" }),
    );

    let error = establisher(Some(Arc::new(RecordingAuthenticator::default())))
        .establish_connection(pending(&server, 2), Some(&credential()))
        .await
        .unwrap_err();

    assert!(matches!(
        error.handshake_phase,
        HandshakePhase::PostHello { generation: 2 }
    ));
    assert!(error.cause.is_command_error(), "{}", error.cause);
}

#[tokio::test]
async fn rejected_credential_is_auth_error() {
    let server = MockServer::start().await;

    let error = establisher(Some(Arc::new(RejectingAuthenticator)))
        .establish_connection(pending(&server, 0), Some(&credential()))
        .await
        .unwrap_err();

    assert!(matches!(
        error.handshake_phase,
        HandshakePhase::PostHello { generation: 0 }
    ));
    assert!(error.cause.is_auth_error(), "{}", error.cause);
    assert!(error.cause.to_string().contains("credential rejected"));
}

#[tokio::test]
async fn hello_failure_is_pre_hello() {
    let server = MockServer::start().await;
    server.refuse_hellos(true);

    let error = establisher(None)
        .establish_connection(pending(&server, 5), None)
        .await
        .unwrap_err();

    assert!(matches!(
        error.handshake_phase,
        HandshakePhase::PreHello { generation: 5 }
    ));
    assert!(error.cause.is_network_error(), "{}", error.cause);
}

#[tokio::test]
async fn monitoring_connection_skips_authentication() {
    let server = MockServer::start().await;
    let authenticator = Arc::new(RecordingAuthenticator::default());

    let (connection, reply) = establisher(Some(authenticator.clone()))
        .establish_monitoring_connection(server.address().clone(), 7)
        .await
        .unwrap();

    assert_eq!(connection.id, 7);
    assert_eq!(reply.server_address, *server.address());
    assert!(authenticator.usernames.lock().unwrap().is_empty());
}
