use std::time::Instant;

use super::Client;
use crate::{
    bson::Document,
    cmap::{conn::next_request_id, Connection},
    concern::WriteConcern,
    error::{Error, Result, NO_WRITES_PERFORMED},
    operation::{Operation, Retryability},
    options::ServerAddress,
    sdam::{HandshakePhase, DEFAULT_SERVER_SELECTION_TIMEOUT},
    selection_criteria::{ReadPreference, SelectionCriteria},
    trace::{TracingRepresentation, COMMAND_TRACING_EVENT_TARGET},
};

impl Client {
    /// Execute the given operation and return the server's reply.
    ///
    /// A server is selected according to the operation's criteria (writes always go to the
    /// primary) and a connection is checked out of its pool for the duration of the command.
    /// Retryable operations that fail with a network error or a "not primary"/"node is
    /// recovering" error are retried once against a freshly selected server; every other
    /// failure is returned as-is.
    pub async fn execute_operation(&self, op: Operation) -> Result<Document> {
        self.execute_operation_with_retry(&op).await
    }

    async fn execute_operation_with_retry(&self, op: &Operation) -> Result<Document> {
        let criteria = self.effective_criteria(op);
        let write_concern = op
            .write_concern()
            .or(self.inner.options.write_concern.as_ref());
        let retryability = self.get_retryability(op, write_concern);
        let selection_timeout = self
            .inner
            .options
            .server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT);

        let mut retry: Option<ExecutionRetry> = None;
        loop {
            let server = match self
                .inner
                .topology
                .select_server_within(&criteria, selection_timeout)
                .await
            {
                Ok(server) => server,
                Err(err) => {
                    retry.first_error()?;
                    return Err(err);
                }
            };
            let server_addr = server.address().clone();

            let mut conn = match server.pool.check_out().await {
                Ok(conn) => conn,
                Err(err) => {
                    retry.first_error()?;

                    let can_retry = match retryability {
                        // Reads are retried on pool cleared errors during checkout even though
                        // the command never reached the server.
                        Retryability::Read if err.is_pool_cleared() => true,
                        _ => retryability.can_retry_error(&err),
                    };
                    if can_retry {
                        retry = Some(self.prepare_retry(op, err, &server_addr));
                        continue;
                    } else {
                        return Err(err);
                    }
                }
            };

            let err = match self
                .execute_operation_on_connection(op, &mut conn, &criteria, write_concern)
                .await
            {
                Ok(reply) => return Ok(reply),
                Err(err) => err,
            };

            self.inner
                .topology
                .handle_application_error(
                    server_addr.clone(),
                    err.clone(),
                    HandshakePhase::after_completion(&conn),
                )
                .await;
            if op.is_write() && (err.is_not_primary() || err.is_shutting_down()) {
                self.inner
                    .topology
                    .mark_primary_stale(server_addr.clone())
                    .await;
            }
            // release the connection to be processed by the connection pool
            drop(conn);
            // release the selected server to decrement its operation count
            drop(server);

            if let Some(r) = retry {
                if retryability.can_retry_error(&err) && !err.contains_label(NO_WRITES_PERFORMED) {
                    return Err(err);
                } else {
                    return Err(r.first_error);
                }
            } else if retryability.can_retry_error(&err) {
                retry = Some(self.prepare_retry(op, err, &server_addr));
                continue;
            } else {
                return Err(err);
            }
        }
    }

    /// Sends a single attempt of `op` over `connection` and interprets the reply.
    async fn execute_operation_on_connection(
        &self,
        op: &Operation,
        connection: &mut Connection,
        criteria: &SelectionCriteria,
        write_concern: Option<&WriteConcern>,
    ) -> Result<Document> {
        let mut cmd = op.build(write_concern)?;
        self.inner
            .topology
            .update_command_with_read_pref(connection.address(), &mut cmd, Some(criteria));

        let request_id = next_request_id();
        let cmd_name = cmd.name.clone();
        let target_db = cmd.target_db.clone();
        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            command_name = cmd_name.as_str(),
            database_name = target_db.as_str(),
            request_id,
            driver_connection_id = connection.id,
            server_host = connection.address.host(),
            server_port = connection.address.port_tracing_representation(),
            "Command started",
        );

        let start_time = Instant::now();
        let result = match connection.send_command(cmd, request_id).await {
            Ok(response) => op.handle_response(response),
            Err(err) => Err(err),
        };
        let duration_ms = start_time.elapsed().as_millis() as u64;

        match result {
            Ok(ref reply) => {
                tracing::debug!(
                    target: COMMAND_TRACING_EVENT_TARGET,
                    command_name = cmd_name.as_str(),
                    database_name = target_db.as_str(),
                    request_id,
                    driver_connection_id = connection.id,
                    duration_ms,
                    reply = reply.tracing_representation(),
                    "Command succeeded",
                );
            }
            Err(ref error) => {
                tracing::debug!(
                    target: COMMAND_TRACING_EVENT_TARGET,
                    command_name = cmd_name.as_str(),
                    database_name = target_db.as_str(),
                    request_id,
                    driver_connection_id = connection.id,
                    duration_ms,
                    failure = %error,
                    "Command failed",
                );
            }
        }

        result
    }

    /// Records the failed first attempt and asks the topology to recheck its servers before the
    /// operation is retried.
    fn prepare_retry(
        &self,
        op: &Operation,
        first_error: Error,
        first_server: &ServerAddress,
    ) -> ExecutionRetry {
        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            command_name = op.name(),
            server_host = first_server.host(),
            server_port = first_server.port_tracing_representation(),
            error = %first_error,
            "Retrying operation",
        );
        self.inner.topology.request_update();
        ExecutionRetry { first_error }
    }

    fn effective_criteria(&self, op: &Operation) -> SelectionCriteria {
        if op.is_write() {
            return SelectionCriteria::ReadPreference(ReadPreference::Primary);
        }
        op.selection_criteria()
            .or(self.inner.options.selection_criteria.as_ref())
            .cloned()
            .unwrap_or(SelectionCriteria::ReadPreference(ReadPreference::Primary))
    }

    /// Returns the retryability level for the execution of this operation.
    fn get_retryability(
        &self,
        op: &Operation,
        write_concern: Option<&WriteConcern>,
    ) -> Retryability {
        if op.is_write() && !write_concern.map(WriteConcern::is_acknowledged).unwrap_or(true) {
            return Retryability::None;
        }
        op.retryability.with_options(&self.inner.options)
    }
}

#[derive(Debug)]
struct ExecutionRetry {
    first_error: Error,
}

trait RetryHelper {
    fn first_error(&mut self) -> Result<()>;
}

impl RetryHelper for Option<ExecutionRetry> {
    fn first_error(&mut self) -> Result<()> {
        match self.take() {
            Some(r) => Err(r.first_error),
            None => Ok(()),
        }
    }
}
