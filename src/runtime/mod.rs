mod acknowledged_message;
mod join_handle;
pub(crate) mod stream;
#[cfg(feature = "rustls-tls")]
mod tls_rustls;
mod worker_handle;

use std::{future::Future, net::SocketAddr, time::Duration};

pub(crate) use self::{
    acknowledged_message::{AcknowledgedMessage, AcknowledgmentReceiver},
    join_handle::AsyncJoinHandle,
    stream::AsyncStream,
    worker_handle::{WorkerHandle, WorkerHandleListener},
};
#[cfg(feature = "rustls-tls")]
pub(crate) use tls_rustls::TlsConfig;

use crate::{error::Result, options::ServerAddress};

/// Spawn a task in the background to run a future.
///
/// This must be called from an async block or function running on a runtime.
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle::spawn(fut)
}

/// Spawn a task in the background to run a future, discarding its handle.
pub(crate) fn execute<F, O>(fut: F)
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    spawn(fut);
}

/// Delay for the specified duration.
pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}

/// Await on a future for a maximum amount of time before returning a timeout error.
pub(crate) async fn timeout<F: Future>(timeout: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| std::io::ErrorKind::TimedOut.into())
}

/// Create a new `Interval` that yields with interval of `duration`.
/// Missed ticks are delayed rather than bursted.
pub(crate) fn interval(duration: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(duration);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

pub(crate) async fn resolve_address(
    address: &ServerAddress,
) -> Result<impl Iterator<Item = SocketAddr> + use<'_>> {
    let socket_addrs = tokio::net::lookup_host((address.host(), address.port_or_default())).await?;
    Ok(socket_addrs)
}
