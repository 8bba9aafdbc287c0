pub mod auth;
mod executor;
pub mod options;
#[cfg(test)]
mod test;

use std::sync::Arc;

use crate::{
    concern::WriteConcern,
    error::Result,
    options::{ClientOptions, ClientOptionsOverlay},
    sdam::{public::TopologyDescription, Topology},
    selection_criteria::SelectionCriteria,
    trace::TOPOLOGY_TRACING_EVENT_TARGET,
    Database,
};

/// This is the main entry point for the API. A `Client` is used to connect to a MongoDB cluster.
/// By default, it will monitor the topology of the cluster, keeping track of any changes, such
/// as servers being added or removed.
///
/// `Client` uses [`std::sync::Arc`](https://doc.rust-lang.org/std/sync/struct.Arc.html) internally,
/// so it can safely be shared across threads or async tasks. For example:
///
/// ```rust
/// # use mongodb_core::{bson::doc, Client, error::Result};
/// #
/// # async fn start_workers() -> Result<()> {
/// let client = Client::with_uri_str("mongodb://example.com").await?;
///
/// for i in 0..5 {
///     let client_ref = client.clone();
///
///     tokio::task::spawn(async move {
///         let db = client_ref.database(&format!("db{}", i));
///         db.run_command(doc! { "ping": 1 }).await
///     });
/// }
/// #
/// # Ok(())
/// # }
/// ```
///
/// ## Clean shutdown
/// The topology's background tasks stop on their own once every `Client` sharing it has been
/// dropped. Use [`Client::shutdown`] to stop them eagerly.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[allow(dead_code, unreachable_code, clippy::diverging_sub_expression)]
const _: fn() = || {
    fn assert_send<T: Send>(_t: T) {}
    fn assert_sync<T: Sync>(_t: T) {}

    let _c: super::Client = todo!();
    assert_send(_c);
    assert_sync(_c);
};

#[derive(Debug)]
struct ClientInner {
    topology: Arc<Topology>,
    options: ClientOptions,
}

impl Client {
    /// Creates a new `Client` connected to the cluster specified by `uri`. `uri` must be a valid
    /// MongoDB connection string.
    ///
    /// See the documentation on
    /// [`ClientOptions::parse`](options/struct.ClientOptions.html#method.parse) for more details.
    pub async fn with_uri_str(uri: impl AsRef<str>) -> Result<Self> {
        let options = ClientOptions::parse(uri)?;

        Client::with_options(options)
    }

    /// Creates a new `Client` connected to the cluster specified by `options`.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        options.validate_for_client()?;

        let topology = Topology::new(options.clone())?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                topology: Arc::new(topology),
                options,
            }),
        })
    }

    /// Creates a new `Client` whose options are this client's with `overlay` layered on top.
    ///
    /// The new client shares this client's topology, and with it the monitors and connection
    /// pools, unless the overlay carries a different credential. In that case a separate
    /// topology is started so that no connection authenticated as one user is handed to the
    /// other.
    pub fn with(&self, overlay: ClientOptionsOverlay) -> Result<Self> {
        let credential_changed = overlay
            .credential
            .as_ref()
            .is_some_and(|credential| Some(credential) != self.inner.options.credential.as_ref());

        let options = self.inner.options.with_overlay(overlay);
        options.validate_for_client()?;

        let topology = if credential_changed {
            tracing::debug!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                "Credential changed, starting a separate topology",
            );
            Arc::new(Topology::new(options.clone())?)
        } else {
            self.inner.topology.clone()
        };

        Ok(Self {
            inner: Arc::new(ClientInner { topology, options }),
        })
    }

    /// Gets the default selection criteria the `Client` uses for operations.
    pub fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.inner.options.selection_criteria.as_ref()
    }

    /// Gets the default write concern the `Client` uses for operations.
    pub fn write_concern(&self) -> Option<&WriteConcern> {
        self.inner.options.write_concern.as_ref()
    }

    /// Gets a handle to a database specified by `name` in the cluster the `Client` is connected to.
    /// The `Database` options (e.g. read preference and write concern) will default to those of the
    /// `Client`.
    ///
    /// This method does not send or receive anything across the wire to the database, so it can be
    /// used repeatedly without incurring any costs from I/O.
    pub fn database(&self, name: &str) -> Database {
        Database::new(self.clone(), name)
    }

    /// Gets a handle to the default database specified in the `ClientOptions` or MongoDB connection
    /// string used to construct this `Client`.
    ///
    /// If no default database was specified, `None` will be returned.
    pub fn default_database(&self) -> Option<Database> {
        self.inner
            .options
            .default_database
            .as_ref()
            .map(|db_name| self.database(db_name))
    }

    /// A snapshot of the deployment as currently known to this client.
    pub fn topology_description(&self) -> TopologyDescription {
        self.inner.topology.description().into()
    }

    /// Shut down this `Client`, stopping its server monitors and closing its connection pools.
    /// Operations started afterwards fail with [`ErrorKind::Shutdown`](crate::error::ErrorKind).
    ///
    /// Clients created from this one with [`Client::with`] share its topology unless their
    /// credential differs, so they are shut down too.
    pub async fn shutdown(self) {
        self.inner.topology.shutdown().await;
    }

    #[cfg(test)]
    pub(crate) fn topology(&self) -> &Arc<Topology> {
        &self.inner.topology
    }
}
