use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::OnceCell;
use tracing::{debug, info};
use vellum_types::PartitionUri;

use crate::authority::{Authority, AuthorityConfig, AuthorityRoute, SchemeModule};
use crate::backend::AuthorityConnection;
use crate::error::{AuthorityError, AuthorityResult};

/// Routes partition URIs to their authorities.
///
/// Scheme modules are registered once per scheme. The first lookup of an
/// authority URI creates its [`Authority`] from the module, using the config
/// registered for that URI or the module's default; later lookups reuse it.
/// Remote partition connections are memoized per partition URI; concurrent
/// callers for one partition share a single connect.
pub struct AuthorityNexus {
    modules: RwLock<HashMap<String, Arc<dyn SchemeModule>>>,
    configs: RwLock<HashMap<String, AuthorityConfig>>,
    authorities: Mutex<HashMap<String, Arc<dyn Authority>>>,
    connections: Mutex<HashMap<PartitionUri, ConnectionSlot>>,
}

type ConnectionSlot = Arc<OnceCell<Arc<dyn AuthorityConnection>>>;

impl AuthorityNexus {
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(HashMap::new()),
            configs: RwLock::new(HashMap::new()),
            authorities: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Register the module for its scheme. A scheme can only be registered once.
    pub fn register_scheme_module(&self, module: Arc<dyn SchemeModule>) -> AuthorityResult<()> {
        let scheme = module.scheme().to_string();
        let mut modules = self.modules.write().expect("lock poisoned");
        if modules.contains_key(&scheme) {
            return Err(AuthorityError::SchemeAlreadyRegistered(scheme));
        }
        debug!(%scheme, "registered scheme module");
        modules.insert(scheme, module);
        Ok(())
    }

    pub fn has_scheme(&self, scheme: &str) -> bool {
        self.modules.read().expect("lock poisoned").contains_key(scheme)
    }

    /// Config used when the authority at `authority_uri` is first created.
    pub fn configure_authority(&self, authority_uri: impl Into<String>, config: AuthorityConfig) {
        self.configs
            .write()
            .expect("lock poisoned")
            .insert(authority_uri.into(), config);
    }

    /// The memoized authority serving `partition`.
    pub fn authority_for(&self, partition: &PartitionUri) -> AuthorityResult<Arc<dyn Authority>> {
        let authority_uri = partition.authority_uri();
        let mut authorities = self.authorities.lock().expect("lock poisoned");
        if let Some(authority) = authorities.get(&authority_uri) {
            return Ok(Arc::clone(authority));
        }

        let module = self
            .modules
            .read()
            .expect("lock poisoned")
            .get(partition.scheme())
            .cloned()
            .ok_or_else(|| AuthorityError::SchemeNotRegistered {
                scheme: partition.scheme().to_string(),
                uri: partition.to_string(),
            })?;
        let config = self
            .configs
            .read()
            .expect("lock poisoned")
            .get(&authority_uri)
            .cloned()
            .unwrap_or_else(|| module.default_config());

        let authority = module.create_authority(&authority_uri, &config)?;
        info!(%authority_uri, local = authority.is_local(), "created authority");
        authorities.insert(authority_uri, Arc::clone(&authority));
        Ok(authority)
    }

    /// Resolve the route for `partition`, connecting to its remote authority
    /// on first use.
    pub async fn obtain_authority_connection(&self, partition: &PartitionUri) -> AuthorityResult<AuthorityRoute> {
        let authority = self.authority_for(partition)?;
        if authority.is_local() {
            return Ok(AuthorityRoute::Local);
        }

        let slot = Arc::clone(
            self.connections
                .lock()
                .expect("lock poisoned")
                .entry(partition.clone())
                .or_default(),
        );
        let connection = slot
            .get_or_try_init(|| async {
                let connection = authority.connect_partition(partition).await?;
                debug!(%partition, "connected partition to remote authority");
                Ok::<_, AuthorityError>(connection)
            })
            .await?;
        Ok(AuthorityRoute::Remote(Arc::clone(connection)))
    }

    /// Forget a memoized partition connection. Returns whether one was
    /// connected.
    pub async fn release_connection(&self, partition: &PartitionUri) -> bool {
        let slot = self.connections.lock().expect("lock poisoned").remove(partition);
        slot.is_some_and(|slot| slot.initialized())
    }
}

impl Default for AuthorityNexus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AuthorityNexus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut schemes: Vec<String> = self
            .modules
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect();
        schemes.sort();
        f.debug_struct("AuthorityNexus")
            .field("schemes", &schemes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalSchemeModule;
    use crate::memory::InMemorySchemeModule;

    fn nexus() -> AuthorityNexus {
        let nexus = AuthorityNexus::new();
        nexus.register_scheme_module(Arc::new(LocalSchemeModule)).unwrap();
        nexus
            .register_scheme_module(Arc::new(InMemorySchemeModule::new()))
            .unwrap();
        nexus
    }

    #[test]
    fn duplicate_scheme_is_rejected() {
        let nexus = nexus();
        let err = nexus
            .register_scheme_module(Arc::new(LocalSchemeModule))
            .unwrap_err();
        assert!(matches!(err, AuthorityError::SchemeAlreadyRegistered(s) if s == "vellum-local"));
    }

    #[tokio::test]
    async fn local_scheme_routes_to_self() {
        let nexus = nexus();
        let uri = PartitionUri::parse("vellum-local:///p1").unwrap();
        let route = nexus.obtain_authority_connection(&uri).await.unwrap();
        assert!(route.is_local());
    }

    #[tokio::test]
    async fn unregistered_scheme_fails_only_when_routed() {
        let nexus = nexus();
        let uri = PartitionUri::parse("elsewhere://host/p1").unwrap();
        assert!(!nexus.has_scheme("elsewhere"));
        let err = nexus.obtain_authority_connection(&uri).await.unwrap_err();
        assert!(matches!(err, AuthorityError::SchemeNotRegistered { .. }));
    }

    #[tokio::test]
    async fn authorities_and_connections_are_memoized() {
        let nexus = nexus();
        let a = PartitionUri::parse("vellum-memory://hub/a").unwrap();
        let b = PartitionUri::parse("vellum-memory://hub/b").unwrap();

        let first = nexus.authority_for(&a).unwrap();
        let second = nexus.authority_for(&b).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let c1 = nexus.obtain_authority_connection(&a).await.unwrap();
        let c2 = nexus.obtain_authority_connection(&a).await.unwrap();
        let (Some(c1), Some(c2)) = (c1.remote(), c2.remote()) else {
            panic!("expected remote routes");
        };
        assert!(Arc::ptr_eq(c1, c2));

        assert!(nexus.release_connection(&a).await);
        assert!(!nexus.release_connection(&a).await);
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_connection() {
        let nexus = nexus();
        let a = PartitionUri::parse("vellum-memory://hub/a").unwrap();
        let b = PartitionUri::parse("vellum-memory://hub/b").unwrap();

        let (a1, a2, b1) = tokio::join!(
            nexus.obtain_authority_connection(&a),
            nexus.obtain_authority_connection(&a),
            nexus.obtain_authority_connection(&b),
        );
        let (a1, a2, b1) = (a1.unwrap(), a2.unwrap(), b1.unwrap());
        let (Some(a1), Some(a2), Some(b1)) = (a1.remote(), a2.remote(), b1.remote()) else {
            panic!("expected remote routes");
        };
        assert!(Arc::ptr_eq(a1, a2));
        assert!(!Arc::ptr_eq(a1, b1));
        assert!(nexus.release_connection(&b).await);
    }

    #[tokio::test]
    async fn unroutable_partition_leaves_no_connection() {
        let nexus = AuthorityNexus::new();
        let uri = PartitionUri::parse("vellum-memory://hub/late").unwrap();
        assert!(nexus.obtain_authority_connection(&uri).await.is_err());
        assert!(!nexus.release_connection(&uri).await);

        nexus
            .register_scheme_module(Arc::new(InMemorySchemeModule::new()))
            .unwrap();
        assert!(nexus.obtain_authority_connection(&uri).await.unwrap().remote().is_some());
        assert!(nexus.release_connection(&uri).await);
    }
}
