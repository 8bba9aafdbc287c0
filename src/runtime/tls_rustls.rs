use std::sync::Arc;

use rustls::{
    pki_types::{pem::PemObject, CertificateDer, ServerName},
    ClientConfig,
    RootCertStore,
};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::{
    client::options::TlsOptions,
    error::{ErrorKind, Result},
};

pub(super) type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Configuration required to use TLS. Creating this is expensive, so its best to cache this value
/// and reuse it for multiple connections.
#[derive(Clone)]
pub(crate) struct TlsConfig {
    connector: TlsConnector,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Create a new `TlsConfig` from the provided options from the user.
    /// This operation is expensive, so the resultant `TlsConfig` should be cached.
    pub(crate) fn new(options: TlsOptions) -> Result<TlsConfig> {
        let mut tls_config = make_rustls_config(options)?;
        tls_config.enable_sni = true;

        let connector: TlsConnector = Arc::new(tls_config).into();
        Ok(TlsConfig { connector })
    }
}

pub(super) async fn tls_connect(
    host: &str,
    tcp_stream: TcpStream,
    cfg: &TlsConfig,
) -> Result<TlsStream> {
    let name = ServerName::try_from(host.to_owned()).map_err(|e| ErrorKind::InvalidTlsConfig {
        message: format!("invalid server name {:?}: {}", host, e),
    })?;

    let conn = cfg.connector.connect(name, tcp_stream).await?;
    Ok(conn)
}

/// Converts `TlsOptions` into a rustls::ClientConfig.
fn make_rustls_config(cfg: TlsOptions) -> Result<ClientConfig> {
    let mut store = RootCertStore::empty();
    if let Some(path) = cfg.ca_file_path {
        let ders = CertificateDer::pem_file_iter(&path)
            .and_then(|iter| iter.collect::<std::result::Result<Vec<_>, _>>())
            .map_err(|error| ErrorKind::InvalidTlsConfig {
                message: format!(
                    "Unable to parse PEM-encoded root certificate from {}: {}",
                    path.display(),
                    error
                ),
            })?;
        store.add_parsable_certificates(ders);
    } else {
        store.roots = webpki_roots::TLS_SERVER_ROOTS.to_vec();
    }

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| ErrorKind::InvalidTlsConfig {
        message: e.to_string(),
    })?
    .with_root_certificates(store)
    .with_no_client_auth();

    Ok(config)
}
