use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::{
    broadcast,
    mpsc::{UnboundedReceiver, UnboundedSender},
    watch::{self, Ref},
};

use super::{
    description::topology::server_selection::{self, SelectedServer},
    monitor::Monitor,
    public::{ServerType, TopologyType},
    Server,
    ServerDescription,
    TopologyDescription,
};
use crate::{
    client::options::{ClientOptions, ServerAddress},
    cmap::{Command, Connection, ConnectionEstablisher, EstablisherOptions},
    error::{Error, ErrorKind, Result},
    runtime::{self, AcknowledgedMessage, WorkerHandle, WorkerHandleListener},
    selection_criteria::SelectionCriteria,
    trace::{
        TracingRepresentation,
        SERVER_SELECTION_TRACING_EVENT_TARGET,
        TOPOLOGY_TRACING_EVENT_TARGET,
    },
};

pub(crate) const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// A struct providing access to the client's current view of the topology.
/// When this and all clones of it are dropped, the topology worker stops, which in turn drops
/// every server along with its pool and monitor.
#[derive(Debug)]
pub(crate) struct Topology {
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    update_requester: UpdateRequester,
    server_selection_timeout: Duration,
    _worker_handle: WorkerHandle,
}

impl Topology {
    pub(crate) fn new(options: ClientOptions) -> Result<Topology> {
        Self::start(options, true)
    }

    /// A topology whose servers are never checked; tests drive it through its updater.
    #[cfg(test)]
    pub(crate) fn new_unmonitored(options: ClientOptions) -> Result<Topology> {
        Self::start(options, false)
    }

    fn start(options: ClientOptions, monitoring: bool) -> Result<Topology> {
        let establisher =
            ConnectionEstablisher::new(EstablisherOptions::from_client_options(&options))?;
        let description = TopologyDescription::new(&options);

        let (update_requester, _) = UpdateRequester::channel();
        let (updater, update_receiver) = TopologyUpdater::channel();
        let (worker_handle, handle_listener) = WorkerHandleListener::channel();

        let (watcher, broadcaster) = TopologyWatcher::channel(TopologyState {
            description: description.clone(),
            servers: HashMap::new(),
        });

        let server_selection_timeout = options
            .server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT);

        let mut worker = TopologyWorker {
            update_receiver,
            broadcaster,
            handle_listener,
            options,
            establisher,
            monitoring,
            topology_watcher: watcher.clone(),
            topology_updater: updater.clone(),
            update_requester: update_requester.clone(),
        };

        tracing::debug!(
            target: TOPOLOGY_TRACING_EVENT_TARGET,
            topology_type = %description.topology_type(),
            "Starting topology monitoring",
        );

        // The seed list becomes the first published state.
        let mut state = TopologyState {
            description,
            servers: HashMap::new(),
        };
        worker.sync_servers(&mut state);
        worker.broadcaster.publish_new_state(state);

        worker.start();

        Ok(Topology {
            watcher,
            updater,
            update_requester,
            server_selection_timeout,
            _worker_handle: worker_handle,
        })
    }

    /// Returns a watcher whose latest state is marked as seen.
    pub(crate) fn watch(&self) -> TopologyWatcher {
        let mut watcher = self.watcher.clone();
        watcher.receiver.borrow_and_update();
        watcher
    }

    #[cfg(test)]
    pub(crate) fn updater(&self) -> TopologyUpdater {
        self.updater.clone()
    }

    /// Ask every monitor to check its server as soon as it is allowed to.
    pub(crate) fn request_update(&self) {
        self.update_requester.request()
    }

    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.updater
            .handle_application_error(address, error, phase)
            .await
    }

    /// Forget what is known about the primary at `address` so it is no longer selected until it
    /// is checked again.
    pub(crate) async fn mark_primary_stale(&self, address: ServerAddress) -> bool {
        self.updater.mark_primary_stale(address).await
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.watcher.borrow_latest().description.topology_type()
    }

    /// Updates the given `command` as needed based on the `criteria`.
    pub(crate) fn update_command_with_read_pref(
        &self,
        server_address: &ServerAddress,
        command: &mut Command,
        criteria: Option<&SelectionCriteria>,
    ) {
        self.watcher
            .borrow_latest()
            .description
            .update_command_with_read_pref(server_address, command, criteria)
    }

    /// The current description of the topology.
    pub(crate) fn description(&self) -> TopologyDescription {
        self.watcher.borrow_latest().description.clone()
    }

    #[cfg(test)]
    pub(crate) fn servers(&self) -> HashMap<ServerAddress, Arc<Server>> {
        self.watcher.borrow_latest().servers.clone()
    }

    /// Select a server matching `criteria`, waiting for the topology to change for up to the
    /// server selection timeout if none is suitable yet.
    pub(crate) async fn select_server(&self, criteria: &SelectionCriteria) -> Result<SelectedServer> {
        self.select_server_within(criteria, self.server_selection_timeout)
            .await
    }

    /// Like [`Topology::select_server`], but waiting for at most `timeout`.
    pub(crate) async fn select_server_within(
        &self,
        criteria: &SelectionCriteria,
        timeout: Duration,
    ) -> Result<SelectedServer> {
        let start_time = Instant::now();
        let mut watcher = self.watch();
        let mut logged_waiting = false;

        tracing::debug!(
            target: SERVER_SELECTION_TRACING_EVENT_TARGET,
            selector = criteria.tracing_representation(),
            topology_description = watcher.borrow_latest().description.tracing_representation(),
            "Server selection started",
        );

        loop {
            let selection = {
                let state = watcher.observe_latest();
                server_selection::attempt_to_select_server(
                    criteria,
                    &state.description,
                    &state.servers,
                )
                .map(|selected| (selected, state.description))
            };

            let description = match selection {
                Ok((Some(server), _)) => {
                    tracing::debug!(
                        target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                        selector = criteria.tracing_representation(),
                        server_host = server.address().host(),
                        server_port = server.address().port_tracing_representation(),
                        "Server selection succeeded",
                    );
                    return Ok(server);
                }
                Ok((None, description)) => description,
                Err(error) => {
                    tracing::debug!(
                        target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                        selector = criteria.tracing_representation(),
                        %error,
                        "Server selection failed",
                    );
                    return Err(error);
                }
            };

            if !logged_waiting {
                tracing::info!(
                    target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                    selector = criteria.tracing_representation(),
                    remaining_time_ms = timeout.saturating_sub(start_time.elapsed()).as_millis() as u64,
                    "Waiting for suitable server to become available",
                );
                logged_waiting = true;
            }

            self.request_update();

            let remaining = timeout.saturating_sub(start_time.elapsed());
            if remaining.is_zero() || !watcher.wait_for_update(remaining).await {
                if !watcher.is_alive() {
                    return Err(ErrorKind::Shutdown.into());
                }
                let error: Error = ErrorKind::ServerSelection {
                    message: description.server_selection_timeout_error_message(criteria),
                }
                .into();
                tracing::debug!(
                    target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                    selector = criteria.tracing_representation(),
                    %error,
                    "Server selection failed",
                );
                return Err(error);
            }
        }
    }

    /// Stops the topology worker. Every server, pool and monitor is dropped once the worker has
    /// processed the request.
    pub(crate) async fn shutdown(&self) {
        self.updater.shutdown().await;
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
    pub(crate) servers: HashMap<ServerAddress, Arc<Server>>,
}

#[derive(Debug)]
pub(crate) enum UpdateMessage {
    ServerUpdate(Box<ServerDescription>),
    MonitorError {
        address: ServerAddress,
        error: Error,
    },
    ApplicationError {
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    },
    MarkPrimaryStale {
        address: ServerAddress,
    },
    Shutdown,
}

/// The task that applies every update to the topology, one at a time and in the order they were
/// received, publishing a new snapshot after each one that changes it.
struct TopologyWorker {
    update_receiver: TopologyUpdateReceiver,
    broadcaster: TopologyBroadcaster,
    handle_listener: WorkerHandleListener,
    update_requester: UpdateRequester,
    options: ClientOptions,
    establisher: ConnectionEstablisher,
    monitoring: bool,

    topology_watcher: TopologyWatcher,
    topology_updater: TopologyUpdater,
}

impl TopologyWorker {
    fn start(mut self) {
        runtime::execute(async move {
            loop {
                let update = tokio::select! {
                    biased;

                    Some(update) = self.update_receiver.recv() => update,
                    _ = self.handle_listener.wait_for_all_handle_drops() => break,
                };

                let (update, ack) = update.into_parts();
                let changed = match update {
                    UpdateMessage::ServerUpdate(sd) => self.update_server(*sd).await,
                    UpdateMessage::MonitorError { address, error } => {
                        self.handle_monitor_error(address, error).await
                    }
                    UpdateMessage::ApplicationError {
                        address,
                        error,
                        phase,
                    } => self.handle_application_error(address, error, phase).await,
                    UpdateMessage::MarkPrimaryStale { address } => {
                        self.mark_primary_stale(address).await
                    }
                    UpdateMessage::Shutdown => {
                        self.drop_servers();
                        ack.acknowledge(true);
                        break;
                    }
                };
                ack.acknowledge(changed);
            }

            self.drop_servers();

            tracing::debug!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                "Stopped topology monitoring",
            );
        });
    }

    /// Publishing a state without servers drops their pools and stops their monitors.
    fn drop_servers(&self) {
        let mut state = self.broadcaster.clone_latest();
        if !state.servers.is_empty() {
            state.servers.clear();
            self.broadcaster.publish_new_state(state);
        }
    }

    /// Creates servers (and their monitors) for addresses new to the description and drops the
    /// ones that are no longer part of it.
    fn sync_servers(&self, state: &mut TopologyState) {
        let description = &state.description;
        state.servers.retain(|address, _| {
            let keep = description.servers.contains_key(address);
            if !keep {
                tracing::debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    server_host = address.host(),
                    server_port = address.port_tracing_representation(),
                    "Stopped server monitoring",
                );
            }
            keep
        });

        for address in state.description.server_addresses() {
            if state.servers.contains_key(address) {
                continue;
            }

            tracing::debug!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                server_host = address.host(),
                server_port = address.port_tracing_representation(),
                "Starting server monitoring",
            );

            let server = Server::new(
                address.clone(),
                &self.options,
                self.establisher.clone(),
                self.topology_updater.clone(),
            );
            state.servers.insert(address.clone(), server);

            if self.monitoring {
                Monitor::start(
                    address.clone(),
                    self.establisher.clone(),
                    self.topology_updater.clone(),
                    self.topology_watcher.clone(),
                    self.update_requester.subscribe(),
                    self.options.clone(),
                );
            }
        }
    }

    /// Applies the server description to a copy of the latest state and publishes the result if
    /// anything changed, including the server's average round trip time. Returns whether a new
    /// state was published.
    async fn update_server(&mut self, sd: ServerDescription) -> bool {
        let server_type = sd.server_type;
        let server_address = sd.address.clone();

        let mut latest_state = self.broadcaster.clone_latest();
        let old_description = latest_state.description.clone();

        if let Err(error) = latest_state.description.update(sd) {
            tracing::warn!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                server_host = server_address.host(),
                server_port = server_address.port_tracing_representation(),
                %error,
                "Failed to apply server description",
            );
            return false;
        }

        let rtt_of = |description: &TopologyDescription| {
            description
                .get_server_description(&server_address)
                .and_then(|sd| sd.average_round_trip_time)
        };
        let rtt_changed = rtt_of(&old_description) != rtt_of(&latest_state.description);

        let topology_changed = self.log_topology_diff(&old_description, &latest_state.description);
        if !topology_changed && !rtt_changed {
            return false;
        }

        self.sync_servers(&mut latest_state);

        if server_type.is_data_bearing()
            || (server_type != ServerType::Unknown
                && latest_state.description.topology_type() == TopologyType::Single)
        {
            if let Some(server) = latest_state.servers.get(&server_address) {
                server.pool.mark_as_ready().await;
            }
        }

        self.broadcaster.publish_new_state(latest_state);
        true
    }

    fn log_topology_diff(
        &self,
        old_description: &TopologyDescription,
        new_description: &TopologyDescription,
    ) -> bool {
        let diff = match old_description.diff(new_description) {
            Some(diff) => diff,
            None => return false,
        };

        for (address, (previous, new)) in diff.changed_servers {
            tracing::debug!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                server_host = address.host(),
                server_port = address.port_tracing_representation(),
                previous_type = %previous.server_type,
                new_type = %new.server_type,
                error = new.error(),
                "Server description changed",
            );
        }

        for address in diff.removed_addresses {
            tracing::debug!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                server_host = address.host(),
                server_port = address.port_tracing_representation(),
                "Server removed from topology",
            );
        }

        for address in diff.added_addresses {
            tracing::debug!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                server_host = address.host(),
                server_port = address.port_tracing_representation(),
                "Server added to topology",
            );
        }

        tracing::debug!(
            target: TOPOLOGY_TRACING_EVENT_TARGET,
            previous_type = %old_description.topology_type(),
            new_type = %new_description.topology_type(),
            new_description = new_description.tracing_representation(),
            "Topology description changed",
        );

        true
    }

    async fn mark_server_as_unknown(&mut self, address: ServerAddress, error: Error) -> bool {
        let description = ServerDescription::new_from_error(address, error);
        self.update_server(description).await
    }

    async fn handle_application_error(
        &mut self,
        address: ServerAddress,
        error: Error,
        handshake: HandshakePhase,
    ) -> bool {
        let server = match self.server(&address) {
            Some(s) => s,
            None => return false,
        };

        // Errors from connections made before the pool was last cleared are already accounted
        // for.
        if handshake.generation() < server.pool.generation() {
            return false;
        }

        if error.is_state_change_error() {
            let updated = self
                .mark_server_as_unknown(server.address.clone(), error.clone())
                .await;

            if updated && (error.is_shutting_down() || handshake.wire_version().unwrap_or(0) < 8)
            {
                server.pool.clear(error).await;
            }
            self.update_requester.request();

            updated
        } else if error.is_non_timeout_network_error()
            || (handshake.is_before_completion()
                && (error.is_auth_error()
                    || error.is_network_timeout()
                    || error.is_command_error()))
        {
            let updated = self
                .mark_server_as_unknown(server.address.clone(), error.clone())
                .await;
            if updated {
                server.pool.clear(error).await;
            }
            updated
        } else {
            false
        }
    }

    async fn handle_monitor_error(&mut self, address: ServerAddress, error: Error) -> bool {
        match self.server(&address) {
            Some(server) => {
                tracing::debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    server_host = address.host(),
                    server_port = address.port_tracing_representation(),
                    %error,
                    "Server heartbeat failed",
                );
                let updated = self.mark_server_as_unknown(address, error.clone()).await;
                if updated {
                    server.pool.clear(error).await;
                }
                updated
            }
            None => false,
        }
    }

    async fn mark_primary_stale(&mut self, address: ServerAddress) -> bool {
        let is_primary = self
            .broadcaster
            .borrow_latest()
            .description
            .primary()
            .map(|primary| primary.address == address)
            .unwrap_or(false);
        if !is_primary {
            return false;
        }

        let updated = self.update_server(ServerDescription::new(&address)).await;
        self.update_requester.request();
        updated
    }

    fn server(&self, address: &ServerAddress) -> Option<Arc<Server>> {
        self.broadcaster
            .borrow_latest()
            .servers
            .get(address)
            .cloned()
    }
}

/// Handle used to send updates to the topology worker. Every update is acknowledged with
/// whether it changed the topology.
#[derive(Debug, Clone)]
pub(crate) struct TopologyUpdater {
    sender: UnboundedSender<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl TopologyUpdater {
    pub(crate) fn channel() -> (TopologyUpdater, TopologyUpdateReceiver) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        let updater = TopologyUpdater { sender: tx };

        let update_receiver = TopologyUpdateReceiver {
            update_receiver: rx,
        };

        (updater, update_receiver)
    }

    async fn send_message(&self, update: UpdateMessage) -> bool {
        let (message, receiver) = AcknowledgedMessage::package(update);

        match self.sender.send(message) {
            Ok(_) => receiver.wait_for_acknowledgment().await.unwrap_or(false),
            _ => false,
        }
    }

    pub(crate) async fn handle_monitor_error(&self, address: ServerAddress, error: Error) -> bool {
        self.send_message(UpdateMessage::MonitorError { address, error })
            .await
    }

    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.send_message(UpdateMessage::ApplicationError {
            address,
            error,
            phase,
        })
        .await
    }

    pub(crate) async fn update(&self, sd: ServerDescription) -> bool {
        self.send_message(UpdateMessage::ServerUpdate(Box::new(sd)))
            .await
    }

    pub(crate) async fn mark_primary_stale(&self, address: ServerAddress) -> bool {
        self.send_message(UpdateMessage::MarkPrimaryStale { address })
            .await
    }

    pub(crate) async fn shutdown(&self) {
        self.send_message(UpdateMessage::Shutdown).await;
    }
}

pub(crate) struct TopologyUpdateReceiver {
    update_receiver: UnboundedReceiver<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl TopologyUpdateReceiver {
    pub(crate) async fn recv(&mut self) -> Option<AcknowledgedMessage<UpdateMessage, bool>> {
        self.update_receiver.recv().await
    }
}

/// Handle used to observe the latest published topology state.
#[derive(Debug, Clone)]
pub(crate) struct TopologyWatcher {
    receiver: watch::Receiver<TopologyState>,
}

impl TopologyWatcher {
    fn channel(initial_state: TopologyState) -> (TopologyWatcher, TopologyBroadcaster) {
        let (tx, rx) = watch::channel(initial_state);
        let watcher = TopologyWatcher { receiver: rx };
        let broadcaster = TopologyBroadcaster { state_sender: tx };
        (watcher, broadcaster)
    }

    /// Whether the topology worker is still publishing updates.
    pub(crate) fn is_alive(&self) -> bool {
        self.receiver.has_changed().is_ok()
    }

    pub(crate) fn server_description(&self, address: &ServerAddress) -> Option<ServerDescription> {
        self.receiver
            .borrow()
            .description
            .get_server_description(address)
            .cloned()
    }

    /// Whether the latest state still contains a server at `address`.
    pub(crate) fn contains_server(&self, address: &ServerAddress) -> bool {
        self.receiver.borrow().servers.contains_key(address)
    }

    /// Clone the latest state, marking it as seen.
    pub(crate) fn observe_latest(&mut self) -> TopologyState {
        self.receiver.borrow_and_update().clone()
    }

    /// Wait for a state newer than the last one seen by this watcher. Returns false if the
    /// timeout elapsed or the topology was shut down first.
    pub(crate) async fn wait_for_update(&mut self, timeout: Duration) -> bool {
        let changed = matches!(
            runtime::timeout(timeout, self.receiver.changed()).await,
            Ok(Ok(()))
        );
        self.receiver.borrow_and_update();
        changed
    }

    pub(crate) fn borrow_latest(&self) -> Ref<'_, TopologyState> {
        self.receiver.borrow()
    }
}

struct TopologyBroadcaster {
    state_sender: watch::Sender<TopologyState>,
}

impl TopologyBroadcaster {
    fn clone_latest(&self) -> TopologyState {
        self.borrow_latest().clone()
    }

    fn borrow_latest(&self) -> Ref<'_, TopologyState> {
        self.state_sender.borrow()
    }

    fn publish_new_state(&self, state: TopologyState) {
        self.state_sender.send_replace(state);
    }
}

/// Broadcasts requests for every monitor to check its server immediately.
#[derive(Clone, Debug)]
struct UpdateRequester {
    sender: broadcast::Sender<()>,
}

impl UpdateRequester {
    fn channel() -> (UpdateRequester, TopologyUpdateRequestReceiver) {
        let (tx, rx) = broadcast::channel(1);
        (
            UpdateRequester { sender: tx },
            TopologyUpdateRequestReceiver { receiver: rx },
        )
    }

    fn request(&self) {
        let _ = self.sender.send(());
    }

    fn subscribe(&self) -> TopologyUpdateRequestReceiver {
        TopologyUpdateRequestReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

pub(crate) struct TopologyUpdateRequestReceiver {
    receiver: broadcast::Receiver<()>,
}

impl TopologyUpdateRequestReceiver {
    /// Wait until a check is requested or `timeout` elapses, whichever comes first.
    pub(crate) async fn wait_for_update_request(&mut self, timeout: Duration) {
        let _: std::result::Result<_, _> = runtime::timeout(timeout, self.receiver.recv()).await;
    }

    pub(crate) fn clear_update_requests(&mut self) {
        while self.receiver.try_recv().is_ok() {}
    }
}

/// Enum describing a point in time during an operation's execution relative to when the MongoDB
/// handshake for the conection being used in that operation.
///
/// This is used to determine the error handling semantics for certain error types.
#[derive(Debug, Clone)]
pub(crate) enum HandshakePhase {
    /// Describes a point that occurred before the initial hello completed (e.g. when opening the
    /// socket).
    PreHello { generation: u32 },

    /// Describes a point in time after the initial hello has completed, but before the entire
    /// handshake (e.g. including authentication) completes.
    PostHello { generation: u32 },

    /// Describes a point in time after the handshake completed (e.g. when the command was sent to
    /// the server).
    AfterCompletion {
        generation: u32,
        max_wire_version: i32,
    },
}

impl HandshakePhase {
    pub(crate) fn after_completion(handshaked_connection: &Connection) -> Self {
        Self::AfterCompletion {
            generation: handshaked_connection.generation,
            // given that this is a handshaked connection, the stream description should
            // always be available, so 0 should never actually be returned here.
            max_wire_version: handshaked_connection
                .stream_description()
                .ok()
                .and_then(|sd| sd.max_wire_version)
                .unwrap_or(0),
        }
    }

    /// The generation of the pool (or connection) the error came from.
    fn generation(&self) -> u32 {
        match self {
            HandshakePhase::PreHello { generation }
            | HandshakePhase::PostHello { generation }
            | HandshakePhase::AfterCompletion { generation, .. } => *generation,
        }
    }

    /// Whether this phase is before the handshake completed or not.
    fn is_before_completion(&self) -> bool {
        !matches!(self, HandshakePhase::AfterCompletion { .. })
    }

    /// The wire version of the server as reported by the handshake. If the handshake did not
    /// complete, this returns `None`.
    fn wire_version(&self) -> Option<i32> {
        match self {
            HandshakePhase::AfterCompletion {
                max_wire_version, ..
            } => Some(*max_wire_version),
            _ => None,
        }
    }
}
