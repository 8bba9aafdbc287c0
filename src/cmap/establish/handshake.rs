use std::sync::Arc;

use derive_where::derive_where;

use crate::{
    client::auth::{AuthConnection, Authenticator, Credential},
    cmap::{Command, Connection, StreamDescription},
    error::Result,
    hello::{client_metadata, hello_command, run_hello, HelloReply},
};

/// Contains the logic needed to handshake a connection.
#[derive(Clone)]
#[derive_where(Debug)]
pub(crate) struct Handshaker {
    /// The hello command to send when handshaking. This will always be identical
    /// given the same client options, so it can be created at the time the Handshaker is created.
    command: Command,

    #[derive_where(skip)]
    authenticator: Option<Arc<dyn Authenticator>>,
}

/// Options used to build a [`Handshaker`].
#[derive(Clone, Default)]
#[derive_where(Debug)]
pub(crate) struct HandshakerOptions {
    /// The application name sent with the client metadata.
    pub(crate) app_name: Option<String>,

    /// The step run after hello to authenticate pooled connections.
    #[derive_where(skip)]
    pub(crate) authenticator: Option<Arc<dyn Authenticator>>,
}

impl Handshaker {
    /// Creates a new Handshaker.
    pub(crate) fn new(options: HandshakerOptions) -> Self {
        let mut command = hello_command(None);
        command
            .body
            .insert("client", client_metadata(options.app_name.as_deref()));

        Self {
            command,
            authenticator: options.authenticator,
        }
    }

    /// Handshakes a connection, caching the server's limits on it as its stream description.
    pub(crate) async fn handshake(&self, conn: &mut Connection) -> Result<HelloReply> {
        let hello_reply = run_hello(conn, self.command.clone()).await?;
        conn.stream_description = Some(StreamDescription::from_hello_reply(&hello_reply));
        Ok(hello_reply)
    }

    /// Runs the configured authentication step, if there is a credential to authenticate with.
    pub(crate) async fn authenticate(
        &self,
        conn: &mut Connection,
        credential: Option<&Credential>,
    ) -> Result<()> {
        if let (Some(authenticator), Some(credential)) = (self.authenticator.as_ref(), credential) {
            authenticator
                .authenticate(AuthConnection::new(conn), credential)
                .await?;
        }
        Ok(())
    }
}
