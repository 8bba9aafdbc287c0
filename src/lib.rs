//! This crate contains the core of a MongoDB client: it keeps a live view of the deployment
//! it is connected to, picks the right server for every operation, pools connections to each
//! server, and runs commands over them with well-defined retry semantics. It uses the [`bson`]
//! crate for BSON support and runs on [`tokio`].
//!
//! # Example Usage
//!
//! ## Connecting to a MongoDB deployment
//! ```no_run
//! # async fn foo() -> mongodb_core::error::Result<()> {
//! use mongodb_core::{Client, options::ClientOptions};
//!
//! // Parse a connection string into an options struct.
//! let mut client_options = ClientOptions::parse("mongodb://localhost:27017")?;
//!
//! // Manually set an option.
//! client_options.app_name = Some("My App".to_string());
//!
//! // Get a handle to the deployment.
//! let client = Client::with_options(client_options)?;
//!
//! // Inspect what the client has discovered so far.
//! for server in client.topology_description().servers() {
//!     println!("{}: {:?}", server.address(), server.server_type());
//! }
//! # Ok(()) }
//! ```
//!
//! ## Running commands
//! ```no_run
//! # async fn foo() -> mongodb_core::error::Result<()> {
//! use mongodb_core::{
//!     bson::doc,
//!     options::{ReadPreference, SelectionCriteria, WriteConcern},
//!     Client,
//!     Operation,
//! };
//!
//! let client = Client::with_uri_str("mongodb://localhost:27017/?replicaSet=rs").await?;
//! let db = client.database("app");
//!
//! // A one-off command, never retried.
//! db.run_command(doc! { "ping": 1 }).await?;
//!
//! // A retryable read from a secondary, keeping at most 10 documents of the first batch.
//! let secondary = SelectionCriteria::ReadPreference(ReadPreference::Secondary { options: None });
//! let reply = client
//!     .execute_operation(
//!         Operation::read("app", doc! { "find": "users", "filter": {} }, secondary).with_limit(10),
//!     )
//!     .await?;
//!
//! // A retryable write on the primary.
//! client
//!     .execute_operation(Operation::write(
//!         "app",
//!         doc! { "insert": "users", "documents": [{ "name": "ada" }] },
//!         WriteConcern::majority(),
//!     ))
//!     .await?;
//! # Ok(()) }
//! ```
//!
//! # Logging
//! The crate emits [`tracing`](https://docs.rs/tracing) events under the `mongodb::command`,
//! `mongodb::connection`, `mongodb::server_selection` and `mongodb::topology` targets. Install
//! any `tracing` subscriber to see them.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod options;

pub use ::bson;

mod client;
mod cmap;
mod coll;
mod concern;
mod db;
pub mod error;
mod hello;
mod operation;
pub(crate) mod runtime;
mod sdam;
mod selection_criteria;
mod serde_util;
#[cfg(test)]
mod test;
mod trace;

pub use crate::{
    client::Client,
    coll::{Collection, Namespace},
    db::Database,
    operation::{Operation, OperationKind},
    sdam::public::*,
};
