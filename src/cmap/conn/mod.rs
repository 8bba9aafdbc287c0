mod command;
mod stream_description;
pub(crate) mod wire;

use std::time::{Duration, Instant};

use derive_where::derive_where;
use tokio::io::BufStream;

use self::wire::Message;
use super::manager::PoolManager;
use crate::{
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    runtime::{self, stream::StreamOptions, AsyncStream},
    trace::CONNECTION_TRACING_EVENT_TARGET,
};
pub(crate) use command::{Command, RawCommandResponse};
pub(crate) use stream_description::StreamDescription;
pub(crate) use wire::next_request_id;

/// The reason a connection was closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnectionClosedReason {
    /// The pool was cleared after the connection was created.
    Stale,

    /// The connection sat unused in the pool for longer than the maximum idle time.
    Idle,

    /// An I/O error occurred while the connection was in use.
    Error,

    /// The connection was dropped while a command was still in flight.
    Dropped,

    /// The pool that owned the connection has been closed.
    PoolClosed,
}

/// A wrapper around a stream that contains all the information needed to maintain a
/// connection to a server, both for use in the pool and for monitoring.
#[derive_where(Debug)]
pub(crate) struct Connection {
    /// Driver-generated ID for the connection, unique within its pool.
    pub(crate) id: u32,

    pub(crate) address: ServerAddress,

    /// The pool generation the connection was created in.
    pub(crate) generation: u32,

    pub(crate) time_created: Instant,

    /// The cached StreamDescription from the connection's handshake.
    pub(crate) stream_description: Option<StreamDescription>,

    /// Marks the time when the connection was last checked into the pool. This is used
    /// to detect if the connection is idle.
    ready_and_available_time: Option<Instant>,

    /// The manager of the pool the connection is checked out of. This is `None` while the
    /// connection is available in the pool, and for connections that aren't pooled at all.
    #[derive_where(skip)]
    pool_manager: Option<PoolManager>,

    /// Whether a command is currently being written or its reply read. A connection dropped
    /// in this state cannot be reused because the stream position is unknown.
    command_executing: bool,

    /// The first I/O error encountered on this connection, if any.
    error: Option<Error>,

    /// How long a single write or read may take before the connection is considered broken.
    socket_timeout: Option<Duration>,

    #[derive_where(skip)]
    stream: BufStream<AsyncStream>,
}

impl Connection {
    pub(crate) fn new(
        address: ServerAddress,
        stream: AsyncStream,
        id: u32,
        generation: u32,
        time_created: Instant,
        socket_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            address,
            generation,
            time_created,
            stream_description: None,
            ready_and_available_time: None,
            pool_manager: None,
            command_executing: false,
            error: None,
            socket_timeout: socket_timeout.filter(|timeout| !timeout.is_zero()),
            stream: BufStream::new(stream),
        }
    }

    /// Open a stream for a connection that has been registered with a pool but not yet
    /// connected.
    pub(crate) async fn connect(
        pending: PendingConnection,
        options: &StreamOptions,
        socket_timeout: Option<Duration>,
    ) -> Result<Self> {
        let stream = AsyncStream::connect(&pending.address, options).await?;
        Ok(Self::new(
            pending.address,
            stream,
            pending.id,
            pending.generation,
            pending.time_created,
            socket_timeout,
        ))
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Helper to mark the time that the connection was checked into the pool for the purpose of
    /// detecting when it becomes idle.
    pub(super) fn mark_as_available(&mut self) {
        self.pool_manager.take();
        self.ready_and_available_time = Some(Instant::now());
    }

    /// Helper to mark that the connection has been checked out of the pool. This ensures that the
    /// connection is not marked as idle based on the time that it's checked out and that it has a
    /// reference to the pool.
    pub(super) fn mark_as_in_use(&mut self, manager: PoolManager) {
        self.pool_manager = Some(manager);
        self.ready_and_available_time.take();
    }

    /// Checks if the connection is idle.
    pub(super) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        self.ready_and_available_time
            .and_then(|ready_and_available_time| {
                max_idle_time.map(|max_idle_time| {
                    Instant::now().duration_since(ready_and_available_time) >= max_idle_time
                })
            })
            .unwrap_or(false)
    }

    /// Checks if the connection is stale.
    pub(super) fn is_stale(&self, current_generation: u32) -> bool {
        self.generation != current_generation
    }

    /// Checks if the connection is currently executing an operation.
    pub(super) fn is_executing(&self) -> bool {
        self.command_executing
    }

    /// Checks if the connection experienced a network error and should be closed.
    pub(super) fn has_errored(&self) -> bool {
        self.error.is_some()
    }

    /// Executes a `Command` and returns a `RawCommandResponse` containing the result from the
    /// server.
    ///
    /// An `Ok(...)` result simply means the server received the command and that the driver
    /// received the response; it does not imply anything about the success of the command
    /// itself.
    pub(crate) async fn send_command(
        &mut self,
        command: Command,
        request_id: impl Into<Option<i32>>,
    ) -> Result<RawCommandResponse> {
        let message = Message::from_command(command, request_id.into())?;
        self.send_message(message).await
    }

    async fn send_message(&mut self, mut message: Message) -> Result<RawCommandResponse> {
        if let Some(ref error) = self.error {
            return Err(Error::internal(format!(
                "attempted to send a command on connection {} to {} after it failed: {}",
                self.id, self.address, error
            )));
        }

        let request_id = message.request_id.unwrap_or_else(next_request_id);
        message.request_id = Some(request_id);
        let max_message_size = self
            .stream_description
            .as_ref()
            .map(|description| description.max_message_size_bytes);

        self.command_executing = true;

        let write_result = match self.socket_timeout {
            Some(timeout) => runtime::timeout(timeout, message.write_to(&mut self.stream))
                .await
                .and_then(|result| result),
            None => message.write_to(&mut self.stream).await,
        };
        self.error = write_result.as_ref().err().cloned();
        write_result?;

        let read_result = match self.socket_timeout {
            Some(timeout) => runtime::timeout(
                timeout,
                Message::read_from(&mut self.stream, max_message_size),
            )
            .await
            .and_then(|result| result),
            None => Message::read_from(&mut self.stream, max_message_size).await,
        };
        self.command_executing = false;
        self.error = read_result.as_ref().err().cloned();
        let response = read_result?;

        if response.response_to != request_id {
            let error = Error::invalid_response(format!(
                "expected a reply to request {} but got a reply to {}",
                request_id, response.response_to
            ));
            self.error = Some(error.clone());
            return Err(error);
        }

        Ok(RawCommandResponse::new(self.address.clone(), response))
    }

    /// Gets the connection's StreamDescription.
    pub(crate) fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description.as_ref().ok_or_else(|| {
            ErrorKind::Internal {
                message: "Stream checked out but not handshaked".to_string(),
            }
            .into()
        })
    }

    /// Close this connection, logging the supplied reason.
    pub(super) fn close_and_drop(mut self, reason: ConnectionClosedReason) {
        self.close(reason);
    }

    fn close(&mut self, reason: ConnectionClosedReason) {
        self.pool_manager.take();
        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            server_address = %self.address,
            connection_id = self.id,
            ?reason,
            "Connection closed",
        );
    }

    /// Nullify the inner state and return it in a new `Connection` for checking back in to
    /// the pool.
    fn take(&mut self) -> Connection {
        Connection {
            id: self.id,
            address: self.address.clone(),
            generation: self.generation,
            time_created: self.time_created,
            stream_description: self.stream_description.take(),
            ready_and_available_time: None,
            pool_manager: None,
            command_executing: self.command_executing,
            error: self.error.take(),
            socket_timeout: self.socket_timeout,
            stream: std::mem::replace(&mut self.stream, BufStream::new(AsyncStream::Null)),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // If the connection has a pool manager, that means that the connection is
        // being dropped when it's checked out. If the pool is still alive, it
        // should check itself back in. Otherwise, the connection should close
        // itself.
        //
        // If the connection does not have a pool manager, then the connection is
        // being dropped while it's not checked out or it isn't pooled. This means
        // that the pool called the `close_and_drop` helper explicitly, so we don't
        // add it back to the pool.
        if let Some(pool_manager) = self.pool_manager.take() {
            let dropped_connection = self.take();
            if let Err(mut conn) = pool_manager.check_in(dropped_connection) {
                conn.close(ConnectionClosedReason::PoolClosed);
            }
        }
    }
}

/// A connection that has been created by a pool but whose stream hasn't been opened yet.
#[derive(Debug)]
pub(crate) struct PendingConnection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: u32,
    pub(crate) time_created: Instant,
}
