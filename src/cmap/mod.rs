#[cfg(test)]
mod test;

pub(crate) mod conn;
mod connection_requester;
pub(crate) mod establish;
mod manager;
pub(crate) mod options;
mod status;
mod worker;

use std::time::{Duration, Instant};

pub(crate) use self::{
    conn::{Command, Connection, PendingConnection, RawCommandResponse, StreamDescription},
    establish::{ConnectionEstablisher, EstablisherOptions},
    status::PoolGenerationSubscriber,
    worker::DEFAULT_MAX_CONNECTING,
};
use self::{
    connection_requester::{ConnectionRequestResult, ConnectionRequester},
    manager::PoolManager,
    options::ConnectionPoolOptions,
    worker::ConnectionPoolWorker,
};
use crate::{
    error::{Error, Result},
    options::ServerAddress,
    sdam::TopologyUpdater,
    trace::CONNECTION_TRACING_EVENT_TARGET,
};

pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 10;

/// A pool of connections to a single server. The pool's state lives in a background worker task;
/// this type is a cheaply cloneable handle used to talk to it.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionPool {
    address: ServerAddress,
    manager: PoolManager,
    connection_requester: ConnectionRequester,
    generation_subscriber: PoolGenerationSubscriber,

    /// If a checkout operation takes longer than `wait_queue_timeout` to begin, the pool will
    /// return an error. If `wait_queue_timeout` is `None`, then the checkout operation will not
    /// time out.
    wait_queue_timeout: Option<Duration>,
}

impl ConnectionPool {
    pub(crate) fn new(
        address: ServerAddress,
        connection_establisher: ConnectionEstablisher,
        server_updater: TopologyUpdater,
        options: Option<ConnectionPoolOptions>,
    ) -> Self {
        let wait_queue_timeout = options.as_ref().and_then(|opts| opts.wait_queue_timeout);

        let (manager, connection_requester, generation_subscriber) = ConnectionPoolWorker::start(
            address.clone(),
            connection_establisher,
            server_updater,
            options,
        );

        Self {
            address,
            manager,
            connection_requester,
            generation_subscriber,
            wait_queue_timeout,
        }
    }

    /// A pool with no worker behind it. Checking out of it fails once the request is dropped.
    #[cfg(test)]
    pub(crate) fn new_mocked(address: ServerAddress) -> Self {
        let (manager, _) = manager::channel();
        let handle = crate::runtime::WorkerHandle::new_mocked();
        let (connection_requester, _) = connection_requester::channel(address.clone(), handle);
        let (_, generation_subscriber) = status::channel(0);

        Self {
            address,
            manager,
            connection_requester,
            generation_subscriber,
            wait_queue_timeout: None,
        }
    }

    /// Checks out a connection from the pool. This method will yield until this thread is at the
    /// front of the wait queue, and then will block again if no available connections are in the
    /// pool and the total number of connections is not less than the max pool size.
    pub(crate) async fn check_out(&self) -> Result<Connection> {
        let time_started = Instant::now();
        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            server_address = %self.address,
            "Connection checkout started",
        );

        let conn = match self
            .connection_requester
            .request(self.wait_queue_timeout)
            .await
        {
            Ok(ConnectionRequestResult::Pooled(c)) => Ok(*c),
            Ok(ConnectionRequestResult::Establishing(task)) => task.await,
            Ok(ConnectionRequestResult::PoolCleared(e)) => {
                Err(Error::pool_cleared_error(&self.address, &e))
            }
            Ok(ConnectionRequestResult::Shutdown) => Err(crate::error::ErrorKind::Shutdown.into()),
            Err(e) => Err(e),
        };

        match conn {
            Ok(ref conn) => {
                tracing::debug!(
                    target: CONNECTION_TRACING_EVENT_TARGET,
                    server_address = %self.address,
                    connection_id = conn.id,
                    duration_ms = time_started.elapsed().as_millis() as u64,
                    "Connection checked out",
                );
            }
            Err(ref error) => {
                tracing::debug!(
                    target: CONNECTION_TRACING_EVENT_TARGET,
                    server_address = %self.address,
                    %error,
                    duration_ms = time_started.elapsed().as_millis() as u64,
                    "Connection checkout failed",
                );
            }
        }

        conn
    }

    /// Increments the generation of the pool and pauses it. Rather than eagerly removing stale
    /// connections from the pool, they are left for the background thread to clean up.
    pub(crate) async fn clear(&self, cause: Error) {
        self.manager.clear(cause).await
    }

    /// Mark the pool as "ready", allowing connections to be created and checked out.
    pub(crate) async fn mark_as_ready(&self) {
        self.manager.mark_as_ready().await;
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation_subscriber.generation()
    }
}
