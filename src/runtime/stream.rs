use std::{
    net::SocketAddr,
    ops::DerefMut,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

use crate::{
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    runtime,
};

#[cfg(feature = "rustls-tls")]
use super::{tls_rustls::tls_connect, TlsConfig};

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
#[cfg(not(target_os = "wasi"))]
const KEEPALIVE_TIME: Duration = Duration::from_secs(120);

/// An async stream possibly using TLS.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub(crate) enum AsyncStream {
    /// A stream that throws away everything written to it and never yields any data. Used as a
    /// placeholder once the real stream has been moved out of a connection.
    Null,

    /// A basic TCP connection to the server.
    Tcp(TcpStream),

    /// A TLS connection over TCP.
    #[cfg(feature = "rustls-tls")]
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

/// The inputs needed to open a stream to a server.
#[derive(Clone, Debug, Default)]
pub(crate) struct StreamOptions {
    pub(crate) connect_timeout: Option<Duration>,
    #[cfg(feature = "rustls-tls")]
    pub(crate) tls_config: Option<TlsConfig>,
}

impl AsyncStream {
    /// Resolves `address` and connects to the first socket address that accepts, trying IPv4
    /// addresses before IPv6 ones. A zero connect timeout means no timeout.
    pub(crate) async fn connect(address: &ServerAddress, options: &StreamOptions) -> Result<Self> {
        let timeout = options.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        let mut resolved: Vec<_> = runtime::resolve_address(address).await?.collect();
        if resolved.is_empty() {
            return Err(ErrorKind::Io(std::sync::Arc::new(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("No DNS results for domain {}", address),
            )))
            .into());
        }
        resolved.sort_by_key(|addr| if addr.is_ipv4() { 0 } else { 1 });

        let mut connect_error = None;
        for socket_addr in &resolved {
            match tcp_try_connect(socket_addr, timeout).await {
                Ok(tcp_stream) => {
                    #[cfg(feature = "rustls-tls")]
                    if let Some(ref cfg) = options.tls_config {
                        let tls_stream = tls_connect(address.host(), tcp_stream, cfg).await?;
                        return Ok(AsyncStream::Tls(tls_stream));
                    }
                    return Ok(AsyncStream::Tcp(tcp_stream));
                }
                Err(e) => {
                    connect_error.get_or_insert(e);
                }
            }
        }

        Err(connect_error
            .unwrap_or_else(|| Error::internal("connecting to all DNS results failed but no error reported")))
    }
}

async fn tcp_try_connect(address: &SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let stream = if timeout.is_zero() {
        TcpStream::connect(address).await?
    } else {
        runtime::timeout(timeout, TcpStream::connect(address)).await??
    };
    stream.set_nodelay(true)?;

    #[cfg(not(target_os = "wasi"))]
    {
        let sock_ref = socket2::SockRef::from(&stream);
        let conf = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
        sock_ref.set_tcp_keepalive(&conf)?;
    }

    Ok(stream)
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut inner) => AsyncRead::poll_read(Pin::new(inner), cx, buf),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut inner) => AsyncRead::poll_read(Pin::new(inner), cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(0)),
            Self::Tcp(ref mut inner) => AsyncWrite::poll_write(Pin::new(inner), cx, buf),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut inner) => AsyncWrite::poll_write(Pin::new(inner), cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut inner) => AsyncWrite::poll_flush(Pin::new(inner), cx),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut inner) => AsyncWrite::poll_flush(Pin::new(inner), cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
        }
    }
}
