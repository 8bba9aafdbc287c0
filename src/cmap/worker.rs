use std::{collections::VecDeque, time::Duration, time::Instant};

use super::{
    conn::{ConnectionClosedReason, PendingConnection},
    connection_requester,
    connection_requester::{
        ConnectionRequest,
        ConnectionRequestReceiver,
        ConnectionRequestResult,
        ConnectionRequester,
    },
    establish::ConnectionEstablisher,
    manager,
    manager::{ManagementRequestReceiver, PoolManagementRequest, PoolManager},
    options::ConnectionPoolOptions,
    status,
    status::{PoolGenerationPublisher, PoolGenerationSubscriber},
    Connection,
    DEFAULT_MAX_POOL_SIZE,
};
use crate::{
    client::auth::Credential,
    error::{Error, Result},
    options::ServerAddress,
    runtime::{self, WorkerHandleListener},
    sdam::TopologyUpdater,
    trace::CONNECTION_TRACING_EVENT_TARGET,
};

pub(crate) const DEFAULT_MAX_CONNECTING: u32 = 2;
const MAINTENANCE_FREQUENCY: Duration = Duration::from_millis(500);

/// A worker task that manages the shared state of the pool.
#[derive(Debug)]
pub(crate) struct ConnectionPoolWorker {
    /// The address the pool's connections will connect to.
    address: ServerAddress,

    /// Current state of the pool. Determines if connections may be checked out
    /// and if min_pool_size connection creation should continue.
    state: PoolState,

    /// The total number of connections managed by the pool, including connections which are
    /// currently checked out of the pool or have yet to be established.
    total_connection_count: u32,

    /// The number of connections currently being established by this pool.
    pending_connection_count: u32,

    /// The ID of the next connection created by the pool.
    next_connection_id: u32,

    /// The current generation of the pool. The generation is incremented whenever the pool is
    /// cleared. Connections belonging to a previous generation are considered stale and will be
    /// closed when checked back in or when popped off of the set of available connections.
    generation: u32,

    /// The established connections that are currently checked into the pool and awaiting usage in
    /// future operations.
    available_connections: VecDeque<Connection>,

    /// Contains the logic for "establishing" a connection. This includes handshaking and
    /// authenticating a connection when it's first created.
    establisher: ConnectionEstablisher,

    /// The credential used to authenticate connections, if any.
    credential: Option<Credential>,

    /// The time between maintenance tasks.
    maintenance_frequency: Duration,

    /// Connections that have been ready for usage in the pool for longer than `max_idle_time` will
    /// be closed either by the background thread or when popped off of the set of available
    /// connections. If `max_idle_time` is `None`, then connections will not be closed due to being
    /// idle.
    max_idle_time: Option<Duration>,

    /// The minimum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool. If fewer than `min_pool_size`
    /// connections are in the pool, the background thread will create more connections and add
    /// them to the pool.
    min_pool_size: Option<u32>,

    /// The maximum number of connections that the pool can manage, including connections checked
    /// out of the pool. If a thread requests a connection and the pool is empty + there are
    /// already max_pool_size connections in use, it will block until one is returned or the
    /// wait_queue_timeout is exceeded.
    max_pool_size: u32,

    /// The maximum number of connections that may be establishing at once.
    max_connecting: u32,

    /// Receiver used to determine if any threads hold references to this pool. If all the
    /// sender ends of this receiver drop, this worker will be notified and drop too.
    handle_listener: WorkerHandleListener,

    /// Receiver for incoming connection check out requests.
    request_receiver: ConnectionRequestReceiver,

    /// Ordered queue of incoming requests waiting for connections.
    wait_queue: VecDeque<ConnectionRequest>,

    /// Receiver for incoming pool management requests (e.g. checking in a connection).
    management_receiver: ManagementRequestReceiver,

    /// Sender used to publish the latest generation.
    generation_publisher: PoolGenerationPublisher,

    /// A pool manager that can be cloned and attached to connections checked out of the pool.
    manager: PoolManager,

    /// A handle used to notify SDAM that a connection establishment error happened. This will
    /// allow the server to transition to Unknown and clear the pool as necessary.
    server_updater: TopologyUpdater,
}

impl ConnectionPoolWorker {
    /// Starts a worker and returns a manager and connection requester.
    /// Once all connection requesters are dropped, the worker will stop executing
    /// and close the pool.
    pub(super) fn start(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        server_updater: TopologyUpdater,
        options: Option<ConnectionPoolOptions>,
    ) -> (PoolManager, ConnectionRequester, PoolGenerationSubscriber) {
        // A max idle time of zero means that connections should not be closed due to idleness.
        let max_idle_time = options
            .as_ref()
            .and_then(|opts| opts.max_idle_time)
            .filter(|max_idle_time| !max_idle_time.is_zero());

        let max_pool_size = options
            .as_ref()
            .and_then(|opts| opts.max_pool_size)
            .unwrap_or(DEFAULT_MAX_POOL_SIZE);

        let max_connecting = options
            .as_ref()
            .and_then(|opts| opts.max_connecting)
            .unwrap_or(DEFAULT_MAX_CONNECTING);

        let min_pool_size = options.as_ref().and_then(|opts| opts.min_pool_size);
        let credential = options.as_ref().and_then(|opts| opts.credential.clone());

        let (handle, handle_listener) = WorkerHandleListener::channel();
        let (connection_requester, request_receiver) =
            connection_requester::channel(address.clone(), handle);
        let (manager, management_receiver) = manager::channel();
        let (generation_publisher, generation_subscriber) = status::channel(0);

        let initial_state = PoolState::Paused(Error::internal("connection pool is initializing"));

        #[cfg(test)]
        let state = if options
            .as_ref()
            .and_then(|opts| opts.ready)
            .unwrap_or(false)
        {
            PoolState::Ready
        } else {
            initial_state
        };
        #[cfg(test)]
        let maintenance_frequency = options
            .as_ref()
            .and_then(|opts| opts.background_thread_interval)
            .unwrap_or(MAINTENANCE_FREQUENCY);

        #[cfg(not(test))]
        let (state, maintenance_frequency) = (initial_state, MAINTENANCE_FREQUENCY);

        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            server_address = %address,
            max_pool_size,
            min_pool_size,
            max_connecting,
            max_idle_time_ms = max_idle_time.map(|d| d.as_millis() as u64),
            "Connection pool created",
        );

        let worker = ConnectionPoolWorker {
            address,
            max_idle_time,
            min_pool_size,
            establisher,
            credential,
            next_connection_id: 1,
            total_connection_count: 0,
            pending_connection_count: 0,
            generation: 0,
            available_connections: VecDeque::new(),
            max_pool_size,
            max_connecting,
            request_receiver,
            wait_queue: Default::default(),
            management_receiver,
            manager: manager.clone(),
            handle_listener,
            state,
            generation_publisher,
            maintenance_frequency,
            server_updater,
        };

        runtime::execute(async move {
            worker.execute().await;
        });

        (manager, connection_requester, generation_subscriber)
    }

    /// Run the worker thread, listening on the various receivers until all handles have been
    /// dropped. Once all handles are dropped, the pool will close any available connections and
    /// reject anything still waiting.
    async fn execute(mut self) {
        let mut maintenance_interval = runtime::interval(self.maintenance_frequency);

        loop {
            let task = tokio::select! {
                // This marker indicates that the futures will be polled in order from top to
                // bottom in this select! macro. We use this to ensure checkIn, clear, and ready
                // always have priority over checkout requests. The order they are processed in
                // will be the order that they're received in, however.
                biased;

                Some(request) = self.management_receiver.recv() => request.into(),
                Some(request) = self.request_receiver.recv() => {
                    PoolTask::CheckOut(request)
                },
                _ = self.handle_listener.wait_for_all_handle_drops() => {
                    // all worker handles have been dropped meaning this
                    // pool has no more references and can be dropped itself.
                    break
                },
                _ = maintenance_interval.tick() => {
                    PoolTask::Maintenance
                },
                else => {
                    break
                }
            };

            match task {
                PoolTask::CheckOut(request) => match self.state {
                    PoolState::Ready => {
                        self.wait_queue.push_back(request);
                    }
                    PoolState::Paused(ref e) => {
                        // if receiver doesn't listen to error that's ok.
                        let _ = request.fulfill(ConnectionRequestResult::PoolCleared(e.clone()));
                    }
                },
                PoolTask::HandleManagementRequest(request) => match request {
                    PoolManagementRequest::CheckIn(connection) => self.check_in(*connection),
                    PoolManagementRequest::Clear { completion_handler } => {
                        let (cause, sender) = completion_handler.into_parts();
                        self.clear(cause);
                        sender.acknowledge(());
                    }
                    PoolManagementRequest::MarkAsReady { completion_handler } => {
                        let (_, sender) = completion_handler.into_parts();
                        self.mark_as_ready();
                        sender.acknowledge(());
                    }
                    PoolManagementRequest::HandleConnectionSucceeded(conn) => {
                        self.handle_connection_succeeded(conn.map(|c| *c))
                    }
                    PoolManagementRequest::HandleConnectionFailed => {
                        self.handle_connection_failed()
                    }
                },
                PoolTask::Maintenance => self.perform_maintenance(),
            }

            while self.can_service_connection_request() {
                match self.wait_queue.pop_front() {
                    Some(request) => self.check_out(request),
                    None => break,
                }
            }
        }

        while let Some(connection) = self.available_connections.pop_front() {
            connection.close_and_drop(ConnectionClosedReason::PoolClosed);
        }

        for request in self.wait_queue.drain(..) {
            let _: std::result::Result<_, _> = request.fulfill(ConnectionRequestResult::Shutdown);
        }

        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            server_address = %self.address,
            "Connection pool closed",
        );
    }

    fn below_max_connecting(&self) -> bool {
        self.pending_connection_count < self.max_connecting
    }

    fn can_service_connection_request(&self) -> bool {
        if !matches!(self.state, PoolState::Ready) {
            return false;
        }

        if !self.available_connections.is_empty() {
            return true;
        }

        self.total_connection_count < self.max_pool_size && self.below_max_connecting()
    }

    fn check_out(&mut self, request: ConnectionRequest) {
        // first attempt to check out an available connection
        while let Some(mut conn) = self.available_connections.pop_back() {
            // Close the connection if it's stale.
            if conn.is_stale(self.generation) {
                self.close_connection(conn, ConnectionClosedReason::Stale);
                continue;
            }

            // Close the connection if it's idle.
            if conn.is_idle(self.max_idle_time) {
                self.close_connection(conn, ConnectionClosedReason::Idle);
                continue;
            }

            conn.mark_as_in_use(self.manager.clone());
            if let Err(result) = request.fulfill(ConnectionRequestResult::Pooled(Box::new(conn))) {
                // checking out thread stopped listening, indicating it hit the WaitQueue
                // timeout, so we put connection back into pool.
                if let Some(mut connection) = result.unwrap_pooled_connection() {
                    connection.mark_as_available();
                    self.available_connections.push_back(connection);
                }
            }

            return;
        }

        // otherwise, attempt to create a connection.
        if self.total_connection_count < self.max_pool_size && self.below_max_connecting() {
            let establisher = self.establisher.clone();
            let pending_connection = self.create_pending_connection();
            let manager = self.manager.clone();
            let server_updater = self.server_updater.clone();
            let credential = self.credential.clone();

            let handle = runtime::spawn(async move {
                let mut establish_result = establish_connection(
                    establisher,
                    pending_connection,
                    server_updater,
                    &manager,
                    credential,
                )
                .await;

                if let Ok(ref mut c) = establish_result {
                    c.mark_as_in_use(manager.clone());
                    manager.handle_connection_succeeded(None);
                }

                establish_result
            });

            // this only fails if the other end stopped listening (e.g. due to timeout), in
            // which case we just let the connection establish in the background.
            let _: std::result::Result<_, _> =
                request.fulfill(ConnectionRequestResult::Establishing(handle));
        } else {
            // put the request to the front of the wait queue so that it will be processed
            // next time a request can be processed.
            self.wait_queue.push_front(request);
        }
    }

    fn create_pending_connection(&mut self) -> PendingConnection {
        self.total_connection_count += 1;
        self.pending_connection_count += 1;

        let pending_connection = PendingConnection {
            id: self.next_connection_id,
            address: self.address.clone(),
            generation: self.generation,
            time_created: Instant::now(),
        };
        self.next_connection_id += 1;

        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            server_address = %self.address,
            connection_id = pending_connection.id,
            "Connection created",
        );

        pending_connection
    }

    /// Process a connection establishment failure.
    fn handle_connection_failed(&mut self) {
        // Establishing a pending connection failed, so that must be reflected in to total
        // connection count.
        self.total_connection_count -= 1;
        self.pending_connection_count -= 1;
    }

    /// Process a successful connection establishment, optionally populating the pool with the
    /// resulting connection.
    fn handle_connection_succeeded(&mut self, connection: Option<Connection>) {
        self.pending_connection_count -= 1;
        if let Some(mut connection) = connection {
            connection.mark_as_available();
            if connection.is_stale(self.generation) {
                self.close_connection(connection, ConnectionClosedReason::Stale);
            } else {
                self.available_connections.push_back(connection);
            }
        }
    }

    fn check_in(&mut self, mut conn: Connection) {
        conn.mark_as_available();

        if conn.has_errored() {
            self.close_connection(conn, ConnectionClosedReason::Error);
        } else if conn.is_stale(self.generation) {
            self.close_connection(conn, ConnectionClosedReason::Stale);
        } else if conn.is_executing() {
            self.close_connection(conn, ConnectionClosedReason::Dropped);
        } else {
            self.available_connections.push_back(conn);
        }
    }

    fn clear(&mut self, cause: Error) {
        self.generation += 1;
        let previous_state = std::mem::replace(&mut self.state, PoolState::Paused(cause.clone()));
        self.generation_publisher.publish(self.generation);

        if matches!(previous_state, PoolState::Ready) {
            tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                server_address = %self.address,
                generation = self.generation,
                error = %cause,
                "Connection pool cleared",
            );

            for request in self.wait_queue.drain(..) {
                // an error means the other end hung up already, which is okay because we were
                // returning an error anyways
                let _: std::result::Result<_, _> =
                    request.fulfill(ConnectionRequestResult::PoolCleared(cause.clone()));
            }
        }
    }

    fn mark_as_ready(&mut self) {
        if matches!(self.state, PoolState::Ready) {
            return;
        }

        self.state = PoolState::Ready;
        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            server_address = %self.address,
            "Connection pool ready",
        );
    }

    /// Close a connection and decrement the total connection count.
    fn close_connection(&mut self, connection: Connection, reason: ConnectionClosedReason) {
        connection.close_and_drop(reason);
        self.total_connection_count -= 1;
    }

    /// Ensure all connections in the pool are valid and that the pool is managing at least
    /// min_pool_size connections.
    fn perform_maintenance(&mut self) {
        self.remove_perished_connections();
        if matches!(self.state, PoolState::Ready) {
            self.ensure_min_connections();
        }
    }

    /// Iterate over the connections and remove any that are stale or idle.
    fn remove_perished_connections(&mut self) {
        while let Some(connection) = self.available_connections.pop_front() {
            if connection.is_stale(self.generation) {
                self.close_connection(connection, ConnectionClosedReason::Stale);
            } else if connection.is_idle(self.max_idle_time) {
                self.close_connection(connection, ConnectionClosedReason::Idle);
            } else {
                self.available_connections.push_front(connection);
                // All subsequent connections are either not idle or not stale since they were
                // checked into the pool later, so we can just quit early.
                break;
            };
        }
    }

    /// Populate the the pool with enough connections to meet the min_pool_size_requirement.
    fn ensure_min_connections(&mut self) {
        if let Some(min_pool_size) = self.min_pool_size {
            while self.total_connection_count < min_pool_size && self.below_max_connecting() {
                let pending_connection = self.create_pending_connection();
                let manager = self.manager.clone();
                let establisher = self.establisher.clone();
                let updater = self.server_updater.clone();
                let credential = self.credential.clone();
                runtime::execute(async move {
                    let connection = establish_connection(
                        establisher,
                        pending_connection,
                        updater,
                        &manager,
                        credential,
                    )
                    .await;

                    if let Ok(connection) = connection {
                        manager.handle_connection_succeeded(Some(connection))
                    }
                });
            }
        }
    }
}

/// Helper covering the common connection establishment behavior between
/// connections established in check_out and those established as part of
/// satisfying min_pool_size.
async fn establish_connection(
    establisher: ConnectionEstablisher,
    pending_connection: PendingConnection,
    server_updater: TopologyUpdater,
    manager: &PoolManager,
    credential: Option<Credential>,
) -> Result<Connection> {
    let connection_id = pending_connection.id;
    let address = pending_connection.address.clone();

    let establish_result = establisher
        .establish_connection(pending_connection, credential.as_ref())
        .await;

    match establish_result {
        Err(ref e) => {
            tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                server_address = %address,
                connection_id,
                error = %e.cause,
                "Connection closed",
            );
            server_updater
                .handle_application_error(
                    address.clone(),
                    e.cause.clone(),
                    e.handshake_phase.clone(),
                )
                .await;
            manager.handle_connection_failed();
        }
        Ok(ref connection) => {
            tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                server_address = %address,
                connection_id,
                duration_ms = connection.time_created.elapsed().as_millis() as u64,
                "Connection ready",
            );
        }
    }

    establish_result.map_err(|e| e.cause)
}

/// The possible states of a pool.
///
/// There is no "closed" state here because the pool is considered closed only
/// once it goes out of scope and cannot be manually closed before then.
#[derive(Debug)]
enum PoolState {
    /// Connections may not be checked out nor created in the background to satisfy minPoolSize.
    /// Holds the error that caused the pool to be paused.
    Paused(Error),

    /// Pool is operational.
    Ready,
}

/// Task to process by the worker.
#[derive(Debug)]
enum PoolTask {
    /// Handle a management request from a `PoolManager`.
    HandleManagementRequest(PoolManagementRequest),

    /// Fulfill the given connection request.
    CheckOut(ConnectionRequest),

    /// Perform pool maintenance (ensure min connections, remove stale or idle connections).
    Maintenance,
}

impl From<PoolManagementRequest> for PoolTask {
    fn from(request: PoolManagementRequest) -> Self {
        PoolTask::HandleManagementRequest(request)
    }
}
