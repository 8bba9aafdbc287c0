pub(super) mod handshake;
#[cfg(test)]
mod test;

use std::time::{Duration, Instant};

use self::handshake::{Handshaker, HandshakerOptions};
use super::{conn::PendingConnection, Connection};
use crate::{
    client::auth::Credential,
    error::{Error, Result},
    hello::HelloReply,
    options::{ClientOptions, ServerAddress, Tls},
    runtime::{
        stream::{StreamOptions, DEFAULT_CONNECT_TIMEOUT},
        AsyncStream,
    },
    sdam::HandshakePhase,
};

/// Contains the logic to establish a connection, including handshaking, authenticating, and
/// potentially more.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionEstablisher {
    /// Contains the logic for handshaking a connection.
    handshaker: Handshaker,

    stream_options: StreamOptions,

    /// Bounds reads on monitoring connections. `None` when connecting is unbounded.
    connect_timeout: Option<Duration>,

    socket_timeout: Option<Duration>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct EstablisherOptions {
    handshake_options: HandshakerOptions,
    tls: Option<Tls>,
    connect_timeout: Option<Duration>,
    socket_timeout: Option<Duration>,
}

impl EstablisherOptions {
    pub(crate) fn from_client_options(opts: &ClientOptions) -> Self {
        Self {
            handshake_options: HandshakerOptions {
                app_name: opts.app_name.clone(),
                authenticator: opts.authenticator.clone(),
            },
            tls: opts.tls.clone(),
            connect_timeout: opts.connect_timeout,
            socket_timeout: opts.socket_timeout,
        }
    }
}

impl ConnectionEstablisher {
    /// Creates a new ConnectionEstablisher from the given options.
    pub(crate) fn new(options: EstablisherOptions) -> Result<Self> {
        let handshaker = Handshaker::new(options.handshake_options);

        let connect_timeout = match options.connect_timeout {
            Some(d) if d.is_zero() => None,
            Some(d) => Some(d),
            None => Some(DEFAULT_CONNECT_TIMEOUT),
        };

        let stream_options = StreamOptions {
            connect_timeout: options.connect_timeout,
            #[cfg(feature = "rustls-tls")]
            tls_config: match options.tls {
                Some(Tls::Enabled(tls_options)) => {
                    Some(crate::runtime::TlsConfig::new(tls_options)?)
                }
                _ => None,
            },
        };

        #[cfg(not(feature = "rustls-tls"))]
        if let Some(Tls::Enabled(_)) = options.tls {
            return Err(crate::error::ErrorKind::InvalidTlsConfig {
                message: "TLS was requested but no TLS backend is enabled".to_string(),
            }
            .into());
        }

        Ok(Self {
            handshaker,
            stream_options,
            connect_timeout,
            socket_timeout: options.socket_timeout,
        })
    }

    /// Establishes a connection: opens the stream, runs the hello handshake, and then the
    /// authentication step if a credential is configured.
    pub(crate) async fn establish_connection(
        &self,
        pending_connection: PendingConnection,
        credential: Option<&Credential>,
    ) -> std::result::Result<Connection, EstablishError> {
        let pool_gen = pending_connection.generation;

        let mut connection =
            Connection::connect(pending_connection, &self.stream_options, self.socket_timeout)
                .await
                .map_err(|e| EstablishError::pre_hello(e, pool_gen))?;

        self.handshaker
            .handshake(&mut connection)
            .await
            .map_err(|e| EstablishError::pre_hello(e, pool_gen))?;

        self.handshaker
            .authenticate(&mut connection, credential)
            .await
            .map_err(|e| EstablishError::post_hello(e, pool_gen))?;

        Ok(connection)
    }

    /// Establishes a connection for monitoring purposes. Monitoring connections are never
    /// authenticated, and reads on them are bounded by the connect timeout.
    pub(crate) async fn establish_monitoring_connection(
        &self,
        address: ServerAddress,
        id: u32,
    ) -> Result<(Connection, HelloReply)> {
        let stream = AsyncStream::connect(&address, &self.stream_options).await?;
        let mut connection = Connection::new(
            address,
            stream,
            id,
            0,
            Instant::now(),
            self.connect_timeout,
        );

        let hello_reply = self.handshaker.handshake(&mut connection).await?;

        Ok((connection, hello_reply))
    }
}

/// An error that occurred while establishing a connection, along with how far the handshake
/// had progressed when it did.
#[derive(Debug, Clone)]
pub(crate) struct EstablishError {
    pub(crate) cause: Error,
    pub(crate) handshake_phase: HandshakePhase,
}

impl EstablishError {
    fn pre_hello(cause: Error, generation: u32) -> Self {
        Self {
            cause,
            handshake_phase: HandshakePhase::PreHello { generation },
        }
    }

    fn post_hello(cause: Error, generation: u32) -> Self {
        Self {
            cause,
            handshake_phase: HandshakePhase::PostHello { generation },
        }
    }
}
