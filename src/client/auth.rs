//! Contains the types needed to specify the auth configuration for a
//! [`Client`](crate::Client).

use std::fmt::Debug;

use futures_util::future::BoxFuture;
use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::{
    bson::Document,
    cmap::{Command, Connection},
    error::Result,
    options::ServerAddress,
};

/// A struct containing authentication information.
///
/// The core never interprets the credential itself; it is handed to the configured
/// [`Authenticator`] once for every newly established connection.
#[derive(Clone, Default, Deserialize, TypedBuilder, PartialEq)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct Credential {
    /// The username to authenticate with.
    pub username: Option<String>,

    /// The database used to authenticate. Defaults to the database named in the connection
    /// string, or "admin".
    pub source: Option<String>,

    /// The password to authenticate with.
    pub password: Option<String>,

    /// The name of the authentication mechanism to use, if any was requested.
    pub mechanism: Option<String>,

    /// Additional properties for the given mechanism.
    pub mechanism_properties: Option<Document>,
}

impl Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Credential")
            .field(&"REDACTED".to_string())
            .finish()
    }
}

impl Credential {
    /// The database that authentication commands should be run against.
    pub fn resolved_source(&self) -> &str {
        self.source.as_deref().unwrap_or("admin")
    }
}

/// A pluggable authentication step, run once on every new connection after the `hello`
/// handshake completes and before the connection is made available for operations.
///
/// An error returned from `authenticate` fails establishment of the connection.
pub trait Authenticator: Send + Sync {
    /// Authenticate the connection using the given credential.
    fn authenticate<'a>(
        &'a self,
        conn: AuthConnection<'a>,
        credential: &'a Credential,
    ) -> BoxFuture<'a, Result<()>>;
}

/// A connection in the middle of being established, lent to an [`Authenticator`].
pub struct AuthConnection<'a> {
    conn: &'a mut Connection,
}

impl<'a> AuthConnection<'a> {
    pub(crate) fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// The address of the server this connection is established to.
    pub fn address(&self) -> &ServerAddress {
        &self.conn.address
    }

    /// Run a command against the given database on this connection, returning the raw reply.
    /// Replies with `ok: 0` are returned as errors.
    pub async fn run_command(&mut self, db: &str, body: Document) -> Result<Document> {
        let name = body
            .keys()
            .next()
            .map(String::from)
            .unwrap_or_default();
        let command = Command::new(name, db, body);
        let response = self.conn.send_command(command, None).await?;
        response.validate()?;
        response.into_document()
    }
}

impl Debug for AuthConnection<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConnection")
            .field("address", &self.conn.address)
            .finish()
    }
}
