use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::{client::auth::Credential, options::ClientOptions};

/// Contains the options for creating a connection pool.
#[derive(Clone, Default, Debug, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
pub(crate) struct ConnectionPoolOptions {
    /// The credential to use for authenticating connections in this pool.
    pub(crate) credential: Option<Credential>,

    /// Connections that have been ready for usage in the pool for longer than `max_idle_time` will
    /// not be used.
    ///
    /// The default is that connections will not be closed due to being idle.
    pub(crate) max_idle_time: Option<Duration>,

    /// The maximum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool.
    ///
    /// The default is 10.
    pub(crate) max_pool_size: Option<u32>,

    /// The minimum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool. If fewer than `min_pool_size`
    /// connections are in the pool, connections will be added to the pool in the background.
    ///
    /// The default is that no minimum is enforced
    pub(crate) min_pool_size: Option<u32>,

    /// The maximum number of new connections that can be created concurrently.
    ///
    /// The default is 2.
    pub(crate) max_connecting: Option<u32>,

    /// How long a check out may wait for a connection before failing.
    ///
    /// The default is to wait until server selection gives up.
    pub(crate) wait_queue_timeout: Option<Duration>,

    /// Whether or not the pool should start in the ready state rather than paused.
    #[cfg(test)]
    pub(crate) ready: Option<bool>,

    /// The frequency at which the pool performs background maintenance.
    #[cfg(test)]
    pub(crate) background_thread_interval: Option<Duration>,
}

impl ConnectionPoolOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            credential: options.credential.clone(),
            max_idle_time: options.max_idle_time,
            max_pool_size: options.max_pool_size,
            min_pool_size: options.min_pool_size,
            max_connecting: options.max_connecting,
            wait_queue_timeout: options.wait_queue_timeout.filter(|t| !t.is_zero()),
            #[cfg(test)]
            ready: None,
            #[cfg(test)]
            background_thread_interval: None,
        }
    }
}
