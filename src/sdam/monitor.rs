use std::time::{Duration, Instant};

use super::{
    description::server::ServerDescription,
    topology::{TopologyUpdateRequestReceiver, TopologyUpdater, TopologyWatcher},
};
use crate::{
    cmap::{Connection, ConnectionEstablisher},
    error::{Error, Result},
    hello::{hello_command, run_hello, HelloReply},
    options::{ClientOptions, ServerAddress},
    runtime,
    trace::TOPOLOGY_TRACING_EVENT_TARGET,
};

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// Monitor that performs regular heartbeats to determine server status.
///
/// The monitor stops once its server is no longer part of the topology or the topology itself
/// has been shut down.
pub(crate) struct Monitor {
    address: ServerAddress,
    connection: Option<Connection>,
    next_connection_id: u32,
    hello_ok: Option<bool>,
    establisher: ConnectionEstablisher,
    topology_updater: TopologyUpdater,
    topology_watcher: TopologyWatcher,
    update_request_receiver: TopologyUpdateRequestReceiver,
    client_options: ClientOptions,
    rtt: RttInfo,
}

impl Monitor {
    pub(crate) fn start(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        update_request_receiver: TopologyUpdateRequestReceiver,
        client_options: ClientOptions,
    ) {
        let monitor = Self {
            address,
            connection: None,
            next_connection_id: 1,
            hello_ok: None,
            establisher,
            topology_updater,
            topology_watcher,
            update_request_receiver,
            client_options,
            rtt: RttInfo::default(),
        };
        runtime::execute(monitor.execute());
    }

    fn is_alive(&self) -> bool {
        self.topology_watcher.is_alive() && self.topology_watcher.contains_server(&self.address)
    }

    async fn execute(mut self) {
        let heartbeat_frequency = self.client_options.heartbeat_frequency();
        let min_frequency = self.client_options.min_heartbeat_frequency();

        while self.is_alive() {
            self.update_request_receiver.clear_update_requests();
            self.check_server().await;

            runtime::delay_for(min_frequency).await;
            if !self.is_alive() {
                break;
            }
            self.update_request_receiver
                .wait_for_update_request(heartbeat_frequency.saturating_sub(min_frequency))
                .await;
        }

        tracing::debug!(
            target: TOPOLOGY_TRACING_EVENT_TARGET,
            server_host = self.address.host(),
            server_port = self.address.port_tracing_representation(),
            "Monitor stopped",
        );
    }

    /// Checks the the server by running a hello command. If an I/O error occurs, the
    /// connection will replaced with a new one.
    ///
    /// Returns true if the topology has changed and false otherwise.
    async fn check_server(&mut self) -> bool {
        let mut retried = false;
        let check_result = match self.perform_hello().await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                let previous_description = self.topology_watcher.server_description(&self.address);
                if e.is_network_error()
                    && previous_description
                        .map(|sd| sd.is_available())
                        .unwrap_or(false)
                {
                    self.handle_error(e).await;
                    retried = true;
                    self.perform_hello().await
                } else {
                    Err(e)
                }
            }
        };

        match check_result {
            Ok(reply) => {
                let average_rtt = self.rtt.average.unwrap_or_default();
                let server_description =
                    ServerDescription::new_from_hello_reply(self.address.clone(), reply, average_rtt);
                self.topology_updater.update(server_description).await
            }
            Err(e) => self.handle_error(e).await || retried,
        }
    }

    async fn perform_hello(&mut self) -> Result<HelloReply> {
        tracing::trace!(
            target: TOPOLOGY_TRACING_EVENT_TARGET,
            server_host = self.address.host(),
            server_port = self.address.port_tracing_representation(),
            awaited = false,
            "Server heartbeat started",
        );

        let start = Instant::now();
        let result = match self.connection {
            Some(ref mut conn) => {
                let command = hello_command(self.hello_ok);
                run_hello(conn, command).await
            }
            None => {
                let id = self.next_connection_id;
                self.next_connection_id += 1;
                self.establisher
                    .establish_monitoring_connection(self.address.clone(), id)
                    .await
                    .map(|(connection, reply)| {
                        self.connection = Some(connection);
                        reply
                    })
            }
        };
        let duration = start.elapsed();

        match result {
            Ok(ref reply) => {
                self.rtt.add_sample(duration);
                self.hello_ok = reply.command_response.hello_ok;
                tracing::trace!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    server_host = self.address.host(),
                    server_port = self.address.port_tracing_representation(),
                    duration_ms = duration.as_millis() as u64,
                    "Server heartbeat succeeded",
                );
            }
            Err(ref error) => {
                self.connection.take();
                tracing::trace!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    server_host = self.address.host(),
                    server_port = self.address.port_tracing_representation(),
                    duration_ms = duration.as_millis() as u64,
                    %error,
                    "Server heartbeat failed",
                );
            }
        }

        result
    }

    async fn handle_error(&mut self, error: Error) -> bool {
        self.rtt.reset();
        self.hello_ok = None;
        self.topology_updater
            .handle_monitor_error(self.address.clone(), error)
            .await
    }
}

/// Exponentially weighted moving average of the round trip times of successful checks.
#[derive(Debug, Default)]
struct RttInfo {
    average: Option<Duration>,
}

impl RttInfo {
    fn add_sample(&mut self, sample: Duration) {
        match self.average {
            Some(old_rtt) => {
                // Average is 20% most recent sample and 80% prior sample.
                self.average = Some((sample / 5) + (old_rtt * 4 / 5))
            }
            None => self.average = Some(sample),
        }
    }

    fn reset(&mut self) {
        self.average = None;
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::RttInfo;

    #[test]
    fn rtt_is_seeded_by_first_sample() {
        let mut rtt = RttInfo::default();
        assert_eq!(rtt.average, None);

        rtt.add_sample(Duration::from_millis(100));
        assert_eq!(rtt.average, Some(Duration::from_millis(100)));
    }

    #[test]
    fn rtt_weights_recent_samples() {
        let mut rtt = RttInfo::default();
        rtt.add_sample(Duration::from_millis(100));
        rtt.add_sample(Duration::from_millis(200));
        assert_eq!(rtt.average, Some(Duration::from_millis(120)));

        rtt.reset();
        assert_eq!(rtt.average, None);
        rtt.add_sample(Duration::from_millis(10));
        assert_eq!(rtt.average, Some(Duration::from_millis(10)));
    }
}
