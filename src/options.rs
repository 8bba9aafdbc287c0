//! Contains all of the types needed to specify options to the client and its operations.
//!
//! Most of the options structs in this module use the
//! [`typed-builder`](https://crates.io/crates/typed-builder) crate to derive a type-safe builder
//! API on them. For example, to create an instance of
//! [`ClientOptions`](struct.ClientOptions.html) with only `app_name` and `retry_writes` set, the
//! builder API can be used as follows:
//!
//! ```rust
//! # use mongodb_core::options::ClientOptions;
//! #
//! # let options = ClientOptions::builder()
//! #                   .app_name("my-app".to_string())
//! #                   .retry_writes(false)
//! #                   .build();
//! ```

pub use crate::{
    client::{
        auth::{AuthConnection, Authenticator, Credential},
        options::{ClientOptions, ClientOptionsOverlay, ServerAddress, Tls, TlsOptions},
    },
    concern::*,
    selection_criteria::*,
};
