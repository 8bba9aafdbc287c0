use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use pretty_assertions::assert_eq;

use super::{
    options::ConnectionPoolOptions,
    Command,
    ConnectionEstablisher,
    ConnectionPool,
    EstablisherOptions,
};
use crate::{
    bson::doc,
    error::{Error, ErrorKind},
    runtime,
    sdam::TopologyUpdater,
    test::util::{MockReply, MockServer},
};

fn pool(server: &MockServer, options: ConnectionPoolOptions) -> ConnectionPool {
    let establisher = ConnectionEstablisher::new(EstablisherOptions::default()).unwrap();
    let (updater, _) = TopologyUpdater::channel();
    ConnectionPool::new(server.address().clone(), establisher, updater, Some(options))
}

fn ready_options() -> ConnectionPoolOptions {
    ConnectionPoolOptions::builder().ready(true).build()
}

#[tokio::test]
async fn checked_in_connection_is_reused() {
    let server = MockServer::start().await;
    let pool = pool(&server, ready_options());

    let connection = pool.check_out().await.unwrap();
    let id = connection.id;
    assert_eq!(connection.generation, 0);
    drop(connection);

    let connection = pool.check_out().await.unwrap();
    assert_eq!(connection.id, id);
    assert_eq!(server.connections_opened(), 1);
}

#[tokio::test]
async fn paused_pool_rejects_check_out() {
    let server = MockServer::start().await;
    let pool = pool(&server, ConnectionPoolOptions::default());

    let error = pool.check_out().await.unwrap_err();
    assert!(error.is_pool_cleared(), "{}", error);
    assert!(error.is_network_error());
    assert_eq!(server.connections_opened(), 0);

    pool.mark_as_ready().await;
    pool.check_out().await.unwrap();
}

#[tokio::test]
async fn clear_pauses_pool_and_retires_connections() {
    let server = MockServer::start().await;
    let pool = pool(&server, ready_options());

    let old = pool.check_out().await.unwrap();
    let old_id = old.id;

    pool.clear(Error::internal("test clear")).await;
    assert_eq!(pool.generation(), 1);

    let error = pool.check_out().await.unwrap_err();
    assert!(error.is_pool_cleared());
    assert!(error.to_string().contains("test clear"), "{}", error);

    pool.mark_as_ready().await;
    drop(old);

    let new = pool.check_out().await.unwrap();
    assert_ne!(new.id, old_id);
    assert_eq!(new.generation, 1);
    assert_eq!(server.connections_opened(), 2);
}

#[tokio::test]
async fn wait_queue_timeout_bounds_check_out() {
    let server = MockServer::start().await;
    let pool = pool(
        &server,
        ConnectionPoolOptions::builder()
            .ready(true)
            .max_pool_size(1)
            .wait_queue_timeout(Duration::from_millis(100))
            .build(),
    );

    let _held = pool.check_out().await.unwrap();
    let error = pool.check_out().await.unwrap_err();
    assert!(
        matches!(*error.kind, ErrorKind::WaitQueueTimeout { .. }),
        "{}",
        error
    );
}

#[tokio::test]
async fn waiters_are_served_in_order() {
    let server = MockServer::start().await;
    let pool = pool(
        &server,
        ConnectionPoolOptions::builder()
            .ready(true)
            .max_pool_size(1)
            .build(),
    );

    let held = pool.check_out().await.unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut waiters = Vec::new();
    for i in 0..3 {
        let pool = pool.clone();
        let order = order.clone();
        waiters.push(runtime::spawn(async move {
            let connection = pool.check_out().await.unwrap();
            order.lock().unwrap().push(i);
            runtime::delay_for(Duration::from_millis(10)).await;
            drop(connection);
        }));
        // Give each waiter time to enter the queue before the next one.
        runtime::delay_for(Duration::from_millis(50)).await;
    }

    drop(held);
    for waiter in waiters {
        waiter.await;
    }

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(server.connections_opened(), 1);
}

#[tokio::test]
async fn min_pool_size_is_maintained() {
    let server = MockServer::start().await;
    let _pool = pool(
        &server,
        ConnectionPoolOptions::builder()
            .ready(true)
            .min_pool_size(2)
            .background_thread_interval(Duration::from_millis(20))
            .build(),
    );

    let populated = runtime::timeout(Duration::from_secs(5), async {
        while server.connections_opened() < 2 {
            runtime::delay_for(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(populated.is_ok());

    runtime::delay_for(Duration::from_millis(100)).await;
    assert_eq!(server.connections_opened(), 2);
}

#[tokio::test]
async fn failed_establishment_releases_capacity() {
    let server = MockServer::start().await;
    let pool = pool(
        &server,
        ConnectionPoolOptions::builder()
            .ready(true)
            .max_pool_size(1)
            .wait_queue_timeout(Duration::from_secs(5))
            .build(),
    );

    server.refuse_hellos(true);
    let error = pool.check_out().await.unwrap_err();
    assert!(error.is_network_error(), "{}", error);

    server.refuse_hellos(false);
    pool.check_out().await.unwrap();
}

#[tokio::test]
async fn pool_lives_while_any_handle_does() {
    let server = MockServer::start().await;
    let pool = pool(
        &server,
        ConnectionPoolOptions::builder()
            .ready(true)
            .max_pool_size(1)
            .build(),
    );
    let held = pool.check_out().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        runtime::spawn(async move { pool.check_out().await.map(|_| ()) })
    };
    runtime::delay_for(Duration::from_millis(50)).await;

    // Only the waiter's handle keeps the pool alive now, so it is served once the held
    // connection comes back.
    drop(pool);
    drop(held);

    assert!(waiter.await.is_ok());
}

#[tokio::test]
async fn errored_connections_make_room_for_new_ones() {
    let server = MockServer::start().await;
    server.push_reply("ping", MockReply::CloseConnection);
    server.push_reply("ping", MockReply::CloseConnection);
    let pool = pool(
        &server,
        ConnectionPoolOptions::builder()
            .ready(true)
            .max_pool_size(2)
            .wait_queue_timeout(Duration::from_secs(5))
            .build(),
    );

    let mut first = pool.check_out().await.unwrap();
    let mut second = pool.check_out().await.unwrap();
    let old_ids = [first.id, second.id];

    let waiter = {
        let pool = pool.clone();
        runtime::spawn(async move { pool.check_out().await.map(|connection| connection.id) })
    };
    runtime::delay_for(Duration::from_millis(50)).await;
    assert_eq!(server.connections_opened(), 2);

    for connection in [&mut first, &mut second] {
        let ping = Command::new("ping", "admin", doc! { "ping": 1 });
        assert!(connection.send_command(ping, None).await.is_err());
    }
    drop(first);
    drop(second);

    let new_id = waiter.await.unwrap();
    assert!(!old_ids.contains(&new_id));

    let fourth = pool.check_out().await.unwrap();
    assert!(!old_ids.contains(&fourth.id));
    assert_eq!(server.connections_opened(), 3);
}
