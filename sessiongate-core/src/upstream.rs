//! [`UpstreamClientConfig`], the opaque configuration describing how to reach one upstream
//! Kubernetes API server.
//!
//! This is handed to the core by the (out-of-scope) credential/identity provider at
//! registration time. The core only reads it, to build an HTTP transport
//! ([`crate::transport`]) for the [`crate::proxy::SessionProxy`]; it never mints or rotates it.

use std::sync::Arc;

use rustls::RootCertStore;
use secrecy::SecretString;
use url::Url;

/// TLS trust material for one upstream connection.
#[derive(Clone)]
pub struct TlsMaterial {
    /// PEM-encoded CA bundle trusted for this upstream, instead of the platform's webpki roots.
    ///
    /// Kubernetes API servers are almost always fronted by a cluster-private CA, so `None` (fall
    /// back to public roots) is mainly a development/test convenience, never the production
    /// path.
    pub ca_pem: Option<Vec<u8>>,
    /// PEM-encoded client certificate chain and private key for mutual TLS, if the upstream
    /// requires client certificate authentication instead of (or alongside) a bearer token.
    pub client_identity: Option<ClientIdentity>,
}

/// A PEM client certificate chain plus its private key, used for mutual TLS.
#[derive(Clone)]
pub struct ClientIdentity {
    /// PEM-encoded certificate chain, leaf first.
    pub cert_chain_pem: Vec<u8>,
    /// PEM-encoded private key matching the leaf certificate.
    pub key_pem: Vec<u8>,
}

/// How the Session Proxy authenticates itself to the upstream, on top of whatever TLS transport
/// security [`TlsMaterial`] establishes.
#[derive(Clone)]
pub enum Credentials {
    /// Add `Authorization: Bearer <token>` to every forwarded request.
    BearerToken(SecretString),
    /// Authentication is carried entirely by [`TlsMaterial::client_identity`]; no additional
    /// header is added.
    ClientCertificate,
    /// No credentials at all. Only sensible against an upstream that performs no authentication
    /// itself: development and test fixtures.
    Anonymous,
}

/// Opaque configuration for one upstream Kubernetes API server.
///
/// Owned by the [`crate::proxy::SessionProxy`] for the lifetime of the session once
/// [`crate::registry::SessionRegistry::register`] consumes it.
#[derive(Clone)]
pub struct UpstreamClientConfig {
    /// Scheme, host, port and path prefix of the upstream API server.
    pub base_url: Url,
    /// TLS trust material for the connection to `base_url`.
    pub tls: TlsMaterial,
    /// How the proxy authenticates itself to the upstream.
    pub credentials: Credentials,
}

impl UpstreamClientConfig {
    /// Builds a `rustls::RootCertStore` for this config: the configured CA bundle if present,
    /// otherwise the platform's webpki roots.
    pub(crate) fn root_store(&self) -> Result<RootCertStore, UpstreamConfigError> {
        let mut store = RootCertStore::empty();
        match &self.tls.ca_pem {
            Some(pem) => {
                let mut reader = std::io::Cursor::new(pem);
                for cert in rustls_pemfile::certs(&mut reader) {
                    let cert = cert.map_err(UpstreamConfigError::InvalidCaPem)?;
                    store
                        .add(cert)
                        .map_err(|err| UpstreamConfigError::InvalidCaCert(err.to_string()))?;
                }
                if store.is_empty() {
                    return Err(UpstreamConfigError::EmptyCaBundle);
                }
            }
            None => {
                store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
        }
        Ok(store)
    }

    /// Builds the `rustls::ClientConfig` to use when dialing `base_url`, or `None` if `base_url`
    /// is not an `https` URL.
    pub(crate) fn tls_client_config(
        &self,
    ) -> Result<Option<Arc<rustls::ClientConfig>>, UpstreamConfigError> {
        if self.base_url.scheme() != "https" {
            return Ok(None);
        }
        let root_store = self.root_store()?;
        let builder = rustls::ClientConfig::builder().with_root_certificates(root_store);
        let config = match &self.tls.client_identity {
            Some(identity) => {
                let mut cert_reader = std::io::Cursor::new(&identity.cert_chain_pem);
                let certs = rustls_pemfile::certs(&mut cert_reader)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(UpstreamConfigError::InvalidCaPem)?;
                let mut key_reader = std::io::Cursor::new(&identity.key_pem);
                let key = rustls_pemfile::private_key(&mut key_reader)
                    .map_err(UpstreamConfigError::InvalidCaPem)?
                    .ok_or_else(|| {
                        UpstreamConfigError::InvalidClientIdentity(
                            "no private key found in PEM".to_string(),
                        )
                    })?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|err| UpstreamConfigError::InvalidClientIdentity(err.to_string()))?
            }
            None => builder.with_no_client_auth(),
        };
        Ok(Some(Arc::new(config)))
    }
}

/// Errors while interpreting an [`UpstreamClientConfig`]'s TLS material.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamConfigError {
    /// The upstream base URL could not be parsed.
    #[error("invalid upstream base URL: {0}")]
    InvalidBaseUrl(#[from] url::ParseError),
    /// The configured CA bundle is not valid PEM.
    #[error("invalid CA certificate PEM: {0}")]
    InvalidCaPem(std::io::Error),
    /// A parsed CA certificate was rejected by rustls.
    #[error("invalid CA certificate: {0}")]
    InvalidCaCert(String),
    /// A CA bundle was configured but contained no certificates.
    #[error("configured CA bundle contains no certificates")]
    EmptyCaBundle,
    /// The configured client identity's certificate chain or key is not valid PEM.
    #[error("invalid client identity PEM: {0}")]
    InvalidClientIdentity(String),
    /// Building the TLS client configuration failed.
    #[error("could not build TLS client config: {0}")]
    Tls(#[from] rustls::Error),
}
