use std::sync::Arc;

use async_trait::async_trait;
use vellum_types::PartitionUri;

use crate::authority::{Authority, AuthorityConfig, SchemeModule};
use crate::backend::AuthorityConnection;
use crate::error::{AuthorityError, AuthorityResult};

/// Scheme whose partitions are authoritative for themselves.
pub const LOCAL_SCHEME: &str = "vellum-local";

/// Scheme module for `vellum-local` partitions.
///
/// Its authorities have no remote side: the local partition log confirms
/// its own commands.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalSchemeModule;

impl SchemeModule for LocalSchemeModule {
    fn scheme(&self) -> &str {
        LOCAL_SCHEME
    }

    fn create_authority(&self, authority_uri: &str, _config: &AuthorityConfig) -> AuthorityResult<Arc<dyn Authority>> {
        Ok(Arc::new(LocalAuthority {
            authority_uri: authority_uri.to_string(),
        }))
    }
}

#[derive(Debug)]
struct LocalAuthority {
    authority_uri: String,
}

#[async_trait]
impl Authority for LocalAuthority {
    fn authority_uri(&self) -> &str {
        &self.authority_uri
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn connect_partition(&self, _partition: &PartitionUri) -> AuthorityResult<Arc<dyn AuthorityConnection>> {
        Err(AuthorityError::NotRemote(self.authority_uri.clone()))
    }
}
