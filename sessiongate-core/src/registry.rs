//! [`SessionRegistry`]: the in-memory mapping from [`SessionIdentifier`] to [`SessionProxy`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::metrics::METRICS_ID_ACTIVE_SESSIONS;
use crate::proxy::{ProxyConstructionError, SessionProxy};
use crate::session_id::SessionIdentifier;
use crate::upstream::UpstreamClientConfig;

/// In-memory {[`SessionIdentifier`] → [`SessionProxy`]} map.
///
/// At most one [`SessionProxy`] exists per identifier at any instant. A proxy reachable from the
/// registry is open; once removed it is closed and never reinserted. Cheaply cloneable: clones
/// share the same underlying map.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    ingress_base_url: String,
    sessions: RwLock<HashMap<SessionIdentifier, Arc<SessionProxy>>>,
    len: AtomicUsize,
    root: CancellationToken,
}

/// Failure constructing a [`SessionProxy`] during [`SessionRegistry::register`].
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    /// The upstream client config could not be turned into a working proxy.
    #[error(transparent)]
    Construction(#[from] ProxyConstructionError),
}

impl SessionRegistry {
    /// Creates an empty registry.
    ///
    /// `ingress_base_url` is the externally-visible base URL used to build public endpoints (see
    /// [`SessionRegistry::public_endpoint`]); it is never used to reach upstream servers.
    /// `root` is the parent cancellation token of every session's context: cancelling it tears
    /// down every currently registered session on the next call to [`SessionRegistry::shutdown`].
    pub fn new(ingress_base_url: impl Into<String>, root: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                ingress_base_url: ingress_base_url.into(),
                sessions: RwLock::new(HashMap::new()),
                len: AtomicUsize::new(0),
                root,
            }),
        }
    }

    /// Registers a new session, or returns the existing one unchanged if `id` is already
    /// registered.
    ///
    /// Sessions are immutable after registration; credential rotation is modeled as
    /// [`SessionRegistry::unregister`] followed by another `register` call. On construction
    /// failure the map is left unchanged and no metrics are affected.
    pub async fn register(
        &self,
        id: SessionIdentifier,
        upstream: UpstreamClientConfig,
    ) -> Result<String, RegisterError> {
        // Fast path: avoid constructing a SessionProxy (which dials no connections but does parse
        // URLs and build a TLS config) if a session is already present.
        if let Some(_existing) = self.inner.sessions.read().get(&id) {
            return Ok(self.public_endpoint(&id));
        }

        let proxy = SessionProxy::new(id.clone(), upstream, self.inner.root.child_token())?;

        let mut sessions = self.inner.sessions.write();
        if let Some(_existing) = sessions.get(&id) {
            // Lost a race with a concurrent register for the same id: drop what we built, keep
            // the existing one, per the immutable-after-registration invariant.
            return Ok(self.public_endpoint(&id));
        }
        sessions.insert(id.clone(), Arc::new(proxy));
        drop(sessions);
        self.inner.len.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!(METRICS_ID_ACTIVE_SESSIONS).set(self.len() as f64);

        Ok(self.public_endpoint(&id))
    }

    /// Removes `id` from the registry, if present, and closes its [`SessionProxy`].
    ///
    /// A no-op if `id` is absent. The close happens after the write lock is released, so slow
    /// teardown (waiting for connections to be forced shut) never blocks other registry
    /// operations.
    pub async fn unregister(&self, id: &SessionIdentifier) {
        let removed = self.inner.sessions.write().remove(id);
        if let Some(proxy) = removed {
            self.inner.len.fetch_sub(1, Ordering::Relaxed);
            metrics::gauge!(METRICS_ID_ACTIVE_SESSIONS).set(self.len() as f64);
            proxy.close();
        }
    }

    /// Looks up the [`SessionProxy`] registered under `id`, if any. `O(1)`, read-locked.
    pub fn lookup(&self, id: &SessionIdentifier) -> Option<Arc<SessionProxy>> {
        self.inner.sessions.read().get(id).cloned()
    }

    /// The externally advertised endpoint for `id`, regardless of whether it is currently
    /// registered.
    ///
    /// Pure: does not consult registry state.
    pub fn public_endpoint(&self, id: &SessionIdentifier) -> String {
        format!("{}/sessiongate/{id}/kas", self.inner.ingress_base_url)
    }

    /// Current number of registered sessions. Lock-free.
    pub fn len(&self) -> usize {
        self.inner.len.load(Ordering::Relaxed)
    }

    /// Removes and closes every currently registered session.
    ///
    /// Intended for process shutdown: the caller must ensure no further [`Self::register`] calls
    /// are made once shutdown has begun. Does not run under a single critical section; entries
    /// may still be visible to concurrent lookups until each is individually removed.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<SessionProxy>> = {
            let mut sessions = self.inner.sessions.write();
            std::mem::take(&mut *sessions).into_values().collect()
        };
        self.inner.len.store(0, Ordering::Relaxed);
        metrics::gauge!(METRICS_ID_ACTIVE_SESSIONS).set(0.0);
        for proxy in drained {
            proxy.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{Credentials, TlsMaterial};

    fn test_upstream() -> UpstreamClientConfig {
        UpstreamClientConfig {
            base_url: "https://k8s.example/base".parse().unwrap(),
            tls: TlsMaterial {
                ca_pem: None,
                client_identity: None,
            },
            credentials: Credentials::Anonymous,
        }
    }

    #[tokio::test]
    async fn register_is_idempotent_on_duplicate_id() {
        let registry = SessionRegistry::new("https://ingress.example", CancellationToken::new());
        let id = SessionIdentifier::new("s1").unwrap();

        let first = registry.register(id.clone(), test_upstream()).await.unwrap();
        let second = registry.register(id.clone(), test_upstream()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn unregister_absent_id_is_noop() {
        let registry = SessionRegistry::new("https://ingress.example", CancellationToken::new());
        let id = SessionIdentifier::new("ghost").unwrap();
        registry.unregister(&id).await;
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn unregister_removes_and_closes() {
        let registry = SessionRegistry::new("https://ingress.example", CancellationToken::new());
        let id = SessionIdentifier::new("s1").unwrap();
        registry.register(id.clone(), test_upstream()).await.unwrap();
        assert!(registry.lookup(&id).is_some());

        registry.unregister(&id).await;
        assert!(registry.lookup(&id).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn public_endpoint_is_pure() {
        let registry = SessionRegistry::new("https://ingress.example", CancellationToken::new());
        let id = SessionIdentifier::new("s1").unwrap();
        assert_eq!(
            registry.public_endpoint(&id),
            "https://ingress.example/sessiongate/s1/kas"
        );
    }

    #[tokio::test]
    async fn shutdown_closes_every_session() {
        let registry = SessionRegistry::new("https://ingress.example", CancellationToken::new());
        registry
            .register(SessionIdentifier::new("s1").unwrap(), test_upstream())
            .await
            .unwrap();
        registry
            .register(SessionIdentifier::new("s2").unwrap(), test_upstream())
            .await
            .unwrap();
        assert_eq!(registry.len(), 2);

        registry.shutdown().await;
        assert_eq!(registry.len(), 0);
        assert!(registry.lookup(&SessionIdentifier::new("s1").unwrap()).is_none());
    }
}
