//! Static session definitions, loaded once at process startup.
//!
//! This binary ships no control plane of its own: the component that mints sessions against
//! short-lived credentials in production is out of scope. For a binary that is still runnable
//! standalone, a flat YAML file takes its place, read once before the front server starts
//! listening. There is no reload and no dynamic add/remove; restart the process to change it.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;
use sessiongate_core::{
    ClientIdentity, Credentials, InvalidSessionIdentifier, SessionIdentifier, TlsMaterial,
    UpstreamClientConfig,
};

#[derive(Debug, Deserialize)]
struct SessionsFile {
    #[serde(default)]
    sessions: Vec<SessionEntry>,
}

#[derive(Debug, Deserialize)]
struct SessionEntry {
    id: String,
    base_url: url::Url,
    #[serde(default)]
    ca_pem_path: Option<PathBuf>,
    #[serde(default)]
    client_cert_path: Option<PathBuf>,
    #[serde(default)]
    client_key_path: Option<PathBuf>,
    /// Name of an environment variable holding the bearer token, never the token itself: this
    /// file is meant to be checked in next to the rest of a deployment's config.
    #[serde(default)]
    bearer_token_env: Option<String>,
}

/// Something went wrong loading or interpreting a sessions file.
#[derive(Debug, thiserror::Error)]
pub enum SessionsFileError {
    /// The file itself could not be read.
    #[error("failed to read sessions file {path}: {source}")]
    Read {
        /// Path that was read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file did not parse as the expected YAML shape.
    #[error("failed to parse sessions file: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// An entry's `id` is not a valid session identifier.
    #[error("invalid session identifier {id:?}: {source}")]
    InvalidId {
        /// The rejected identifier.
        id: String,
        /// Why it was rejected.
        #[source]
        source: InvalidSessionIdentifier,
    },
    /// A PEM file referenced by an entry could not be read.
    #[error("failed to read {path}: {source}")]
    ReadMaterial {
        /// Path that was read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// An entry named `bearer_token_env` but the variable is not set in this process's
    /// environment.
    #[error("bearer_token_env {var:?} for session {id:?} is not set")]
    MissingBearerTokenEnv {
        /// The session the entry belongs to.
        id: String,
        /// The environment variable name that was expected.
        var: String,
    },
}

/// Parses `path` into the sessions it statically describes.
pub fn load(
    path: &Path,
) -> Result<Vec<(SessionIdentifier, UpstreamClientConfig)>, SessionsFileError> {
    let raw = fs::read_to_string(path).map_err(|source| SessionsFileError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file: SessionsFile = serde_yaml::from_str(&raw)?;

    let mut sessions = Vec::with_capacity(file.sessions.len());
    for entry in file.sessions {
        let id =
            SessionIdentifier::new(entry.id.clone()).map_err(|source| SessionsFileError::InvalidId {
                id: entry.id.clone(),
                source,
            })?;

        let ca_pem = entry.ca_pem_path.as_deref().map(read_material).transpose()?;
        let client_identity = match (entry.client_cert_path, entry.client_key_path) {
            (Some(cert), Some(key)) => Some(ClientIdentity {
                cert_chain_pem: read_material(&cert)?,
                key_pem: read_material(&key)?,
            }),
            // A cert with no key (or vice versa) is a misconfigured entry; treat it as no
            // client identity rather than silently picking one field to honor.
            (None, None) | (Some(_), None) | (None, Some(_)) => None,
        };

        let credentials = match (&client_identity, entry.bearer_token_env) {
            (Some(_), _) => Credentials::ClientCertificate,
            (None, Some(var)) => {
                let token = env::var(&var).map_err(|_| SessionsFileError::MissingBearerTokenEnv {
                    id: entry.id.clone(),
                    var,
                })?;
                Credentials::BearerToken(SecretString::from(token))
            }
            (None, None) => Credentials::Anonymous,
        };

        sessions.push((
            id,
            UpstreamClientConfig {
                base_url: entry.base_url,
                tls: TlsMaterial {
                    ca_pem,
                    client_identity,
                },
                credentials,
            },
        ));
    }
    Ok(sessions)
}

fn read_material(path: &Path) -> Result<Vec<u8>, SessionsFileError> {
    fs::read(path).map_err(|source| SessionsFileError::ReadMaterial {
        path: path.to_path_buf(),
        source,
    })
}
