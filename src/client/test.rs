use std::{sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use pretty_assertions::assert_eq;

use crate::{
    bson::{doc, Document},
    error::{ErrorKind, Result, NO_WRITES_PERFORMED},
    options::{
        AuthConnection,
        Authenticator,
        ClientOptions,
        ClientOptionsOverlay,
        Credential,
        WriteConcern,
    },
    test::util::{MockReply, MockServer},
    Client,
    Operation,
    ServerType,
    TopologyType,
};

struct NoopAuthenticator;

impl Authenticator for NoopAuthenticator {
    fn authenticate<'a>(
        &'a self,
        _conn: AuthConnection<'a>,
        _credential: &'a Credential,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

fn client(server: &MockServer) -> Client {
    Client::with_options(ClientOptions::for_test(vec![server.address().clone()])).unwrap()
}

fn find() -> Operation {
    Operation::read("app", doc! { "find": "users", "filter": {} }, None)
}

fn insert() -> Operation {
    Operation::write("app", doc! { "insert": "users", "documents": [{ "x": 1 }] }, None)
}

fn command_error_reply(code: i32, message: &str) -> MockReply {
    MockReply::Document(doc! { "ok": 0, "code": code, "errmsg": message })
}

fn command_code(error: &crate::error::Error) -> Option<i32> {
    match *error.kind {
        ErrorKind::Command(ref command_error) => Some(command_error.code),
        _ => None,
    }
}

#[tokio::test]
async fn read_returns_limited_reply() {
    let server = MockServer::start().await;
    server.push_reply(
        "find",
        MockReply::Document(doc! {
            "ok": 1,
            "cursor": { "id": 0_i64, "ns": "app.users", "firstBatch": [{ "x": 1 }, { "x": 2 }] },
        }),
    );
    let client = client(&server);

    let reply = client.execute_operation(find().with_limit(1)).await.unwrap();

    let batch = reply
        .get_document("cursor")
        .unwrap()
        .get_array("firstBatch")
        .unwrap();
    assert_eq!(batch.len(), 1);

    let sent = server.received("find");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].get_str("$db").unwrap(), "app");
}

#[tokio::test]
async fn read_is_retried_once_after_network_error() {
    let server = MockServer::start().await;
    server.push_reply("find", MockReply::CloseConnection);
    let client = client(&server);

    client.execute_operation(find()).await.unwrap();
    assert_eq!(server.received("find").len(), 2);
}

#[tokio::test]
async fn retry_happens_at_most_once() {
    let server = MockServer::start().await;
    server.push_reply("find", MockReply::CloseConnection);
    server.push_reply("find", MockReply::CloseConnection);
    let client = client(&server);

    let error = client.execute_operation(find()).await.unwrap_err();
    assert!(error.is_network_error(), "{}", error);
    assert_eq!(server.received("find").len(), 2);
}

#[tokio::test]
async fn non_retryable_operation_is_not_retried() {
    let server = MockServer::start().await;
    server.push_reply("find", MockReply::CloseConnection);
    let client = client(&server);

    let error = client
        .execute_operation(find().retryable(false))
        .await
        .unwrap_err();
    assert!(error.is_network_error(), "{}", error);
    assert_eq!(server.received("find").len(), 1);
}

#[tokio::test]
async fn retry_reads_option_disables_retries() {
    let server = MockServer::start().await;
    server.push_reply("find", MockReply::CloseConnection);
    let client = client(&server)
        .with(ClientOptionsOverlay::builder().retry_reads(false).build())
        .unwrap();

    assert!(client.execute_operation(find()).await.is_err());
    assert_eq!(server.received("find").len(), 1);
}

#[tokio::test]
async fn command_error_is_not_retried() {
    let server = MockServer::start().await;
    server.push_reply("find", command_error_reply(2, "bad value"));
    let client = client(&server);

    let error = client.execute_operation(find()).await.unwrap_err();
    assert_eq!(command_code(&error), Some(2));
    assert_eq!(server.received("find").len(), 1);
}

#[tokio::test]
async fn first_error_is_returned_when_retry_fails_differently() {
    let server = MockServer::start().await;
    server.push_reply("find", MockReply::CloseConnection);
    server.push_reply("find", command_error_reply(2, "bad value"));
    let client = client(&server);

    let error = client.execute_operation(find()).await.unwrap_err();
    assert!(error.is_network_error(), "{}", error);
    assert_eq!(server.received("find").len(), 2);
}

#[tokio::test]
async fn write_is_retried_after_not_primary() {
    let server = MockServer::start().await;
    server.push_reply("insert", command_error_reply(10107, "not primary"));
    let client = client(&server);

    client.execute_operation(insert()).await.unwrap();
    assert_eq!(server.received("insert").len(), 2);
}

#[tokio::test]
async fn no_writes_performed_returns_first_error() {
    let server = MockServer::start().await;
    server.push_reply("insert", MockReply::CloseConnection);
    server.push_reply(
        "insert",
        MockReply::Document(doc! {
            "ok": 0,
            "code": 91,
            "errmsg": "shutting down",
            "errorLabels": [NO_WRITES_PERFORMED],
        }),
    );
    let client = client(&server);

    let error = client.execute_operation(insert()).await.unwrap_err();
    assert!(error.is_network_error(), "{}", error);
    assert_eq!(server.received("insert").len(), 2);
}

#[tokio::test]
async fn unacknowledged_write_is_not_retried() {
    let server = MockServer::start().await;
    server.push_reply("insert", MockReply::CloseConnection);
    let client = client(&server);

    let op = Operation::write(
        "app",
        doc! { "insert": "users", "documents": [{ "x": 1 }] },
        WriteConcern::nodes(0),
    );
    assert!(client.execute_operation(op).await.is_err());
    assert_eq!(server.received("insert").len(), 1);
}

#[tokio::test]
async fn write_concern_error_is_reported() {
    let server = MockServer::start().await;
    server.push_reply(
        "insert",
        MockReply::Document(doc! {
            "ok": 1,
            "n": 1,
            "writeConcernError": { "code": 100, "codeName": "UnsatisfiableWriteConcern", "errmsg": "not enough nodes" },
        }),
    );
    let client = client(&server);

    let error = client.execute_operation(insert()).await.unwrap_err();
    assert_eq!(command_code(&error), Some(100));
    assert_eq!(server.received("insert").len(), 1);
}

#[tokio::test]
async fn client_write_concern_is_applied() {
    let server = MockServer::start().await;
    let client = client(&server)
        .with(
            ClientOptionsOverlay::builder()
                .write_concern(WriteConcern::majority())
                .build(),
        )
        .unwrap();

    client.execute_operation(insert()).await.unwrap();

    let sent = server.received("insert");
    assert_eq!(
        sent[0].get_document("writeConcern").unwrap(),
        &doc! { "w": "majority" }
    );
}

#[tokio::test]
async fn run_command_goes_through_database() {
    let server = MockServer::start().await;
    let client = client(&server);
    let db = client.database("app");

    let reply = db.run_command(doc! { "ping": 1 }).await.unwrap();
    assert_eq!(reply, doc! { "ok": 1 });

    let sent: Vec<Document> = server.received("ping");
    assert_eq!(sent[0].get_str("$db").unwrap(), "app");
    assert_eq!(db.collection("users").namespace().to_string(), "app.users");
}

#[tokio::test]
async fn topology_description_reflects_discovery() {
    let server = MockServer::start().await;
    let client = client(&server);
    client
        .database("admin")
        .run_command(doc! { "ping": 1 })
        .await
        .unwrap();

    let description = client.topology_description();
    assert_eq!(description.topology_type(), TopologyType::Single);
    let info = description.server(server.address()).unwrap();
    assert_eq!(info.server_type(), ServerType::Standalone);
}

#[tokio::test]
async fn with_shares_topology_unless_credential_changes() {
    let server = MockServer::start().await;
    let mut options = ClientOptions::for_test(vec![server.address().clone()]);
    options.authenticator = Some(Arc::new(NoopAuthenticator));
    options.credential = Some(Credential::builder().username("alice".to_string()).build());
    let client = Client::with_options(options).unwrap();

    let same = client
        .with(
            ClientOptionsOverlay::builder()
                .credential(Credential::builder().username("alice".to_string()).build())
                .retry_writes(false)
                .build(),
        )
        .unwrap();
    assert!(Arc::ptr_eq(client.topology(), same.topology()));

    let other = client
        .with(
            ClientOptionsOverlay::builder()
                .credential(Credential::builder().username("bob".to_string()).build())
                .build(),
        )
        .unwrap();
    assert!(!Arc::ptr_eq(client.topology(), other.topology()));
}

#[tokio::test]
async fn overlay_selection_timeout_applies_to_shared_topology() {
    let server = MockServer::start().await;
    server.refuse_hellos(true);
    let client = client(&server)
        .with(
            ClientOptionsOverlay::builder()
                .server_selection_timeout(Duration::from_millis(200))
                .build(),
        )
        .unwrap();

    let error = client
        .database("app")
        .run_command(doc! { "ping": 1 })
        .await
        .unwrap_err();
    assert!(error.is_server_selection_error(), "{}", error);
}

#[tokio::test]
async fn default_database_comes_from_uri() {
    let server = MockServer::start().await;
    let client = Client::with_uri_str(format!("mongodb://{}/app", server.address()))
        .await
        .unwrap();
    assert_eq!(client.default_database().unwrap().name(), "app");
}

#[tokio::test]
async fn operations_fail_after_shutdown() {
    let server = MockServer::start().await;
    let client = client(&server);
    let db = client.database("app");
    db.run_command(doc! { "ping": 1 }).await.unwrap();

    client.shutdown().await;

    let error = db.run_command(doc! { "ping": 1 }).await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Shutdown), "{}", error);
}

#[tokio::test]
async fn credentials_from_uri_need_an_authenticator() {
    let server = MockServer::start().await;
    let uri = format!("mongodb://alice:secret@{}/app", server.address());

    let error = Client::with_uri_str(&uri).await.unwrap_err();
    assert!(error.to_string().contains("authenticator"), "{}", error);

    let mut options = ClientOptions::parse(&uri).unwrap();
    assert_eq!(
        options.credential.as_ref().unwrap().username.as_deref(),
        Some("alice")
    );
    options.authenticator = Some(Arc::new(NoopAuthenticator));
    let client = Client::with_options(options).unwrap();
    client
        .database("app")
        .run_command(doc! { "ping": 1 })
        .await
        .unwrap();
}
