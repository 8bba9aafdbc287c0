use std::{fmt::Debug, sync::Arc};

use crate::{
    bson::Document,
    concern::WriteConcern,
    error::Result,
    operation::Operation,
    selection_criteria::SelectionCriteria,
    Client,
    Collection,
};

/// `Database` is the client-side abstraction of a MongoDB database. It can be used to run
/// database-level commands or to obtain handles to specific collections within the database. A
/// `Database` can only be obtained through a [`Client`](struct.Client.html) by calling
/// [`Client::database`](struct.Client.html#method.database).
///
/// `Database` uses [`std::sync::Arc`](https://doc.rust-lang.org/std/sync/struct.Arc.html) internally,
/// so it can safely be shared across threads or async tasks. For example:
///
/// ```rust
/// # use mongodb_core::{bson::doc, Client, error::Result};
/// #
/// # async fn start_workers() -> Result<()> {
/// # let client = Client::with_uri_str("mongodb://example.com").await?;
/// let db = client.database("items");
///
/// for i in 0..5 {
///     let db_ref = db.clone();
///
///     tokio::task::spawn(async move {
///         let collection = db_ref.collection(&format!("coll{}", i));
///
///         // Do something with the collection
///     });
/// }
/// #
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

#[derive(Debug)]
struct DatabaseInner {
    client: Client,
    name: String,
}

impl Database {
    pub(crate) fn new(client: Client, name: &str) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                client,
                name: name.to_string(),
            }),
        }
    }

    /// Get the `Client` that this database descended from.
    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    /// Gets the name of the `Database`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Gets the read preference of the `Database`.
    pub fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.inner.client.selection_criteria()
    }

    /// Gets the write concern of the `Database`.
    pub fn write_concern(&self) -> Option<&WriteConcern> {
        self.inner.client.write_concern()
    }

    /// Gets a handle to a collection in this database with the provided name.
    ///
    /// This method does not send or receive anything across the wire to the database, so it can be
    /// used repeatedly without incurring any costs from I/O.
    pub fn collection(&self, name: &str) -> Collection {
        Collection::new(self.clone(), name)
    }

    /// Runs a database-level command using the database's default selection criteria.
    ///
    /// Note that no inspection is done on `command`, so the command will not use the database's
    /// default write concern. If a specific write concern is desired, it must be specified
    /// manually. The command is never retried.
    pub async fn run_command(&self, command: Document) -> Result<Document> {
        self.run_command_with_selection_criteria(command, None)
            .await
    }

    /// Runs a database-level command on a server matching `selection_criteria`, falling back to
    /// the database's default selection criteria when `None` is given.
    pub async fn run_command_with_selection_criteria(
        &self,
        command: Document,
        selection_criteria: impl Into<Option<SelectionCriteria>>,
    ) -> Result<Document> {
        let selection_criteria = selection_criteria
            .into()
            .or_else(|| self.selection_criteria().cloned());
        let operation = Operation::read(self.name(), command, selection_criteria).retryable(false);
        self.client().execute_operation(operation).await
    }
}
