mod parse;

use std::{
    fmt::{self, Display, Formatter},
    hash::{Hash, Hasher},
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use derive_where::derive_where;
use serde::{de::Error as SerdeError, Deserialize, Deserializer};
use typed_builder::TypedBuilder;

use crate::{
    client::auth::{Authenticator, Credential},
    concern::WriteConcern,
    error::{Error, ErrorKind, Result},
    sdam::{DEFAULT_HEARTBEAT_FREQUENCY, MIN_HEARTBEAT_FREQUENCY},
    selection_criteria::SelectionCriteria,
};

pub(crate) const DEFAULT_PORT: u16 = 27017;

/// An enum representing the address of a MongoDB server.
#[derive(Clone, Debug, Eq)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    Tcp {
        /// The hostname or IP address where the MongoDB server can be found.
        host: String,

        /// The TCP port that the MongoDB server is listening on.
        ///
        /// The default is 27017.
        port: Option<u16>,
    },
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str()).map_err(|e| D::Error::custom(format!("{}", e)))
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::Tcp {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Tcp { host, port },
                Self::Tcp {
                    host: other_host,
                    port: other_port,
                },
            ) => {
                host == other_host
                    && port.unwrap_or(DEFAULT_PORT) == other_port.unwrap_or(DEFAULT_PORT)
            }
        }
    }
}

impl Hash for ServerAddress {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        match self {
            Self::Tcp { host, port } => {
                host.hash(state);
                port.unwrap_or(DEFAULT_PORT).hash(state);
            }
        }
    }
}

impl FromStr for ServerAddress {
    type Err = Error;
    fn from_str(address: &str) -> Result<Self> {
        ServerAddress::parse(address)
    }
}

impl ServerAddress {
    /// Parses an address string into a `ServerAddress`. Hosts are normalized to lowercase, and
    /// IPv6 literals must be enclosed in brackets (e.g. `[::1]:27017`).
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();

        let (hostname, port) = if let Some(ip_literal) = address.strip_prefix('[') {
            let Some((hostname, port)) = ip_literal.split_once(']') else {
                return Err(Error::invalid_argument(format!(
                    "invalid server address {}: missing closing ']' in IP literal hostname",
                    address
                )));
            };

            if let Err(parse_error) = std::net::Ipv6Addr::from_str(hostname) {
                return Err(Error::invalid_argument(format!(
                    "invalid server address {}: {}",
                    address, parse_error
                )));
            }

            let port = if port.is_empty() {
                None
            } else if let Some(port) = port.strip_prefix(':') {
                Some(port)
            } else {
                return Err(Error::invalid_argument(format!(
                    "invalid server address {}: the hostname can only be followed by a port \
                     prefixed with ':', got {}",
                    address, port
                )));
            };

            (hostname, port)
        } else {
            match address.split_once(':') {
                Some((hostname, port)) => (hostname, Some(port)),
                None => (address, None),
            }
        };

        if hostname.is_empty() {
            return Err(Error::invalid_argument(format!(
                "invalid server address {}: the hostname cannot be empty",
                address
            )));
        }

        let port = if let Some(port) = port {
            match u16::from_str(port) {
                Ok(0) | Err(_) => {
                    return Err(Error::invalid_argument(format!(
                        "invalid server address {}: the port must be an integer between 1 and \
                         65535, got {}",
                        address, port
                    )))
                }
                Ok(port) => Some(port),
            }
        } else {
            None
        };

        Ok(Self::Tcp {
            host: hostname.to_lowercase(),
            port,
        })
    }

    /// The hostname of this address.
    pub fn host(&self) -> &str {
        match self {
            Self::Tcp { host, .. } => host.as_str(),
        }
    }

    /// The port of this address, if one was given.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => *port,
        }
    }

    pub(crate) fn port_or_default(&self) -> u16 {
        self.port().unwrap_or(DEFAULT_PORT)
    }
}

impl Display for ServerAddress {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => {
                if host.contains(':') {
                    write!(fmt, "[{}]:{}", host, port.unwrap_or(DEFAULT_PORT))
                } else {
                    write!(fmt, "{}:{}", host, port.unwrap_or(DEFAULT_PORT))
                }
            }
        }
    }
}

/// Contains the options that can be used to create a new [`Client`](crate::Client).
#[derive(Clone, Deserialize, TypedBuilder)]
#[derive_where(Debug)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ClientOptions {
    /// The initial list of seeds that the Client should connect to.
    ///
    /// Note that by default, the driver will autodiscover other nodes in the cluster. To connect
    /// directly to a single server (rather than autodiscovering the rest of the cluster), set the
    /// `direct_connection` field to `true`.
    #[builder(default = vec![ServerAddress::default()], setter(!into))]
    #[serde(default = "default_hosts")]
    pub hosts: Vec<ServerAddress>,

    /// The application name that the Client will send to the server as part of the handshake.
    pub app_name: Option<String>,

    /// The connect timeout passed to each underlying TcpStream when attempting to connect to the
    /// server. A value of zero indicates no timeout.
    ///
    /// The default value is 10 seconds.
    pub connect_timeout: Option<Duration>,

    /// The credential to use for authenticating connections made by this client.
    pub credential: Option<Credential>,

    /// The step that authenticates each new connection with `credential`. Required whenever a
    /// credential is set.
    #[derive_where(skip)]
    #[serde(skip)]
    pub authenticator: Option<Arc<dyn Authenticator>>,

    /// Specifies whether the Client should directly connect to a single host rather than
    /// autodiscover all servers in the cluster.
    ///
    /// The default value is false.
    pub direct_connection: Option<bool>,

    /// The amount of time each monitoring task should wait between performing server checks.
    ///
    /// The default value is 10 seconds.
    pub heartbeat_freq: Option<Duration>,

    /// When running a read operation with a ReadPreference that allows selecting secondaries,
    /// `local_threshold` is used to determine how much longer the average round trip time between
    /// the driver and server is allowed compared to the least round trip time of all the suitable
    /// servers. For example, if the average round trip times of the suitable servers are 5 ms, 10
    /// ms, and 15 ms, and the local threshold is 8 ms, then the first two servers are within the
    /// latency window and could be chosen for the operation, but the last one is not.
    ///
    /// A value of zero indicates that there is no latency window, so only the server with the
    /// lowest average round trip time is eligible.
    ///
    /// The default value is 15 ms.
    pub local_threshold: Option<Duration>,

    /// The amount of time that a connection can remain idle in a connection pool before being
    /// closed. A value of zero indicates that connections should not be closed due to being idle.
    ///
    /// By default, connections will not be closed due to being idle.
    pub max_idle_time: Option<Duration>,

    /// The maximum amount of connections that the Client should allow to be created in a
    /// connection pool for a given server. If an operation is attempted on a server while
    /// `max_pool_size` connections are checked out, the operation will block until an in-progress
    /// operation finishes and its connection is checked back into the pool.
    ///
    /// The default value is 10.
    pub max_pool_size: Option<u32>,

    /// The minimum number of connections that should be available in a server's connection pool at
    /// a given time. If fewer than `min_pool_size` connections are in the pool, connections will
    /// be added to the pool in the background until `min_pool_size` is reached.
    ///
    /// The default value is 0.
    pub min_pool_size: Option<u32>,

    /// The maximum number of new connections that can be created concurrently.
    ///
    /// The default value is 2.
    pub max_connecting: Option<u32>,

    /// The name of the replica set that the Client should connect to.
    pub repl_set_name: Option<String>,

    /// Whether or not the client should retry a read operation if the operation fails.
    ///
    /// The default value is true.
    pub retry_reads: Option<bool>,

    /// Whether or not the client should retry a write operation if the operation fails.
    ///
    /// The default value is true.
    pub retry_writes: Option<bool>,

    /// The default selection criteria for operations performed on the Client. See the
    /// SelectionCriteria type documentation for more details.
    pub selection_criteria: Option<SelectionCriteria>,

    /// The amount of time the Client should attempt to select a server for an operation before
    /// timing out.
    ///
    /// The default value is 30 seconds.
    pub server_selection_timeout: Option<Duration>,

    /// The amount of time a single read or write on a connection may take before the
    /// connection is considered failed.
    ///
    /// By default, there is no socket timeout.
    pub socket_timeout: Option<Duration>,

    /// The TLS configuration for the Client to use in its connections with the server.
    ///
    /// By default, TLS is disabled.
    pub tls: Option<Tls>,

    /// The amount of time a task should block while waiting to check out a connection before
    /// returning an error. Note that if there are fewer than `max_pool_size` connections checked
    /// out or if a connection is available in the pool, checking out a connection will not block.
    ///
    /// By default, tasks will wait indefinitely for a connection to become available.
    pub wait_queue_timeout: Option<Duration>,

    /// Specifies the default write concern for operations performed on the Client. See the
    /// WriteConcern type documentation for more details.
    pub write_concern: Option<WriteConcern>,

    /// The database named in the connection string, if any.
    #[builder(setter(skip))]
    #[serde(skip)]
    pub(crate) default_database: Option<String>,

    /// Used by tests to override MIN_HEARTBEAT_FREQUENCY.
    #[builder(setter(skip))]
    #[serde(skip)]
    #[cfg(test)]
    pub(crate) heartbeat_freq_test: Option<Duration>,
}

fn default_hosts() -> Vec<ServerAddress> {
    vec![ServerAddress::default()]
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Specifies whether TLS configuration should be used with the operations that the
/// [`Client`](crate::Client) performs.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub enum Tls {
    /// Enable TLS with the specified options.
    Enabled(TlsOptions),

    /// Disable TLS.
    Disabled,
}

impl From<TlsOptions> for Tls {
    fn from(options: TlsOptions) -> Self {
        Self::Enabled(options)
    }
}

impl From<TlsOptions> for Option<Tls> {
    fn from(options: TlsOptions) -> Self {
        Some(Tls::Enabled(options))
    }
}

/// Specifies the TLS configuration that the [`Client`](crate::Client) should use.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct TlsOptions {
    /// The path to the CA file that the [`Client`](crate::Client) should use for TLS. If
    /// none is specified, then the driver will use the Mozilla root certificates from the
    /// `webpki-roots` crate.
    pub ca_file_path: Option<PathBuf>,
}

/// Options that can be layered over an existing client's options with
/// [`Client::with`](crate::Client::with). Unset fields keep the existing client's value.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ClientOptionsOverlay {
    /// Replaces the default selection criteria.
    pub selection_criteria: Option<SelectionCriteria>,

    /// Replaces the default write concern.
    pub write_concern: Option<WriteConcern>,

    /// Replaces the read retry setting.
    pub retry_reads: Option<bool>,

    /// Replaces the write retry setting.
    pub retry_writes: Option<bool>,

    /// Replaces the server selection timeout.
    pub server_selection_timeout: Option<Duration>,

    /// Replaces the credential. A client derived with a different credential gets its own
    /// topology and connection pools.
    pub credential: Option<Credential>,
}

impl ClientOptions {
    /// Parses a `mongodb://` connection string into a `ClientOptions` struct. If the string is
    /// malformed or one of the options has an invalid value, an error will be returned.
    ///
    /// The format of a connection string is described
    /// [here](https://www.mongodb.com/docs/manual/reference/connection-string/#connection-string-formats).
    ///
    /// The following options are supported in the options query string:
    ///
    ///   * `appName`: maps to the `app_name` field
    ///   * `authMechanism`: maps to the `mechanism` field of the `credential` field
    ///   * `authSource`: maps to the `source` field of the `credential` field
    ///   * `connectTimeoutMS`: maps to the `connect_timeout` field
    ///   * `directConnection`: maps to the `direct_connection` field
    ///   * `heartbeatFrequencyMS`: maps to the `heartbeat_freq` field
    ///   * `journal`: maps to the `journal` field of the `write_concern` field
    ///   * `localThresholdMS`: maps to the `local_threshold` field
    ///   * `maxConnecting`: maps to the `max_connecting` field
    ///   * `maxIdleTimeMS`: maps to the `max_idle_time` field
    ///   * `maxStalenessSeconds`: maps to the `max_staleness` field of the `selection_criteria`
    ///     field
    ///   * `maxPoolSize`: maps to the `max_pool_size` field
    ///   * `minPoolSize`: maps to the `min_pool_size` field
    ///   * `readPreference`: maps to the `selection_criteria` field
    ///   * `readPreferenceTags`: maps to the `tag_sets` field of the `selection_criteria` field;
    ///     may be repeated
    ///   * `replicaSet`: maps to the `repl_set_name` field
    ///   * `retryReads`: maps to the `retry_reads` field
    ///   * `retryWrites`: maps to the `retry_writes` field
    ///   * `serverSelectionTimeoutMS`: maps to the `server_selection_timeout` field
    ///   * `socketTimeoutMS`: maps to the `socket_timeout` field
    ///   * `tls`/`ssl`: enables or disables TLS
    ///   * `tlsCAFile`: maps to the `ca_file_path` field of the `tls` field
    ///   * `w`: maps to the `w` field of the `write_concern` field
    ///   * `waitQueueTimeoutMS`: maps to the `wait_queue_timeout` field
    ///   * `wTimeoutMS`: maps to the `w_timeout` field of the `write_concern` field
    pub fn parse(s: impl AsRef<str>) -> Result<Self> {
        let parser = parse::ClientOptionsParser::parse(s.as_ref())?;
        let options: Self = parser.into();
        options.validate()?;
        Ok(options)
    }

    /// Ensure the options set are valid, returning an error describing the problem if they are
    /// not.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::invalid_argument("at least one host must be specified"));
        }

        if let Some(true) = self.direct_connection {
            if self.hosts.len() > 1 {
                return Err(Error::invalid_argument(
                    "cannot specify multiple seeds with directConnection=true",
                ));
            }
        }

        if let Some(0) = self.max_pool_size {
            return Err(Error::invalid_argument("cannot specify maxPoolSize=0"));
        }

        if let Some(0) = self.max_connecting {
            return Err(Error::invalid_argument("cannot specify maxConnecting=0"));
        }

        if let (Some(min), Some(max)) = (self.min_pool_size, self.max_pool_size) {
            if min > max {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "min pool size {} is greater than max pool size {}",
                        min, max
                    ),
                }
                .into());
            }
        }

        if let Some(heartbeat_freq) = self.heartbeat_freq {
            if heartbeat_freq < self.min_heartbeat_frequency() {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "'heartbeat_freq' must be at least {}ms, but {}ms was given",
                        self.min_heartbeat_frequency().as_millis(),
                        heartbeat_freq.as_millis()
                    ),
                }
                .into());
            }
        }

        if let Some(ref write_concern) = self.write_concern {
            write_concern.validate()?;
        }

        Ok(())
    }

    /// Validates the options and checks that they can back a client. A connection string can
    /// carry a credential but never an authenticator, so that pairing is only enforced here.
    pub(crate) fn validate_for_client(&self) -> Result<()> {
        self.validate()?;

        if self.credential.is_some() && self.authenticator.is_none() {
            return Err(Error::invalid_argument(
                "a credential was provided but no authenticator was configured to use it",
            ));
        }

        Ok(())
    }

    /// Returns a new options value with the fields of `overlay` layered over these.
    pub(crate) fn with_overlay(&self, overlay: ClientOptionsOverlay) -> Self {
        let mut merged = self.clone();
        if let Some(criteria) = overlay.selection_criteria {
            merged.selection_criteria = Some(criteria);
        }
        if let Some(write_concern) = overlay.write_concern {
            merged.write_concern = Some(write_concern);
        }
        if let Some(retry_reads) = overlay.retry_reads {
            merged.retry_reads = Some(retry_reads);
        }
        if let Some(retry_writes) = overlay.retry_writes {
            merged.retry_writes = Some(retry_writes);
        }
        if let Some(timeout) = overlay.server_selection_timeout {
            merged.server_selection_timeout = Some(timeout);
        }
        if let Some(credential) = overlay.credential {
            merged.credential = Some(credential);
        }
        merged
    }

    pub(crate) fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
    }

    pub(crate) fn min_heartbeat_frequency(&self) -> Duration {
        #[cfg(test)]
        {
            self.heartbeat_freq_test.unwrap_or(MIN_HEARTBEAT_FREQUENCY)
        }

        #[cfg(not(test))]
        {
            MIN_HEARTBEAT_FREQUENCY
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(hosts: Vec<ServerAddress>) -> Self {
        let mut options = Self::builder().hosts(hosts).build();
        options.heartbeat_freq_test = Some(Duration::from_millis(50));
        options
    }
}
