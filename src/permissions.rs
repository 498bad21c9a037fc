use crate::cache::CacheStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Collection-scoped capability bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectPermissions {
    pub can_create: bool,
    pub can_read: bool,
    pub can_edit: bool,
    pub can_delete: bool,
    pub can_view_all: bool,
    pub can_modify_all: bool,
}

impl ObjectPermissions {
    /// Sentinel for collections the user has no entry for: deny everything.
    pub const NONE: ObjectPermissions = ObjectPermissions {
        can_create: false,
        can_read: false,
        can_edit: false,
        can_delete: false,
        can_view_all: false,
        can_modify_all: false,
    };
}

/// Per-tenant-per-user permission snapshot, cached with TTL.
/// `all_permissive` short-circuits every downstream check; it is set for
/// platform admins and as the fail-open fallback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolvedPermissions {
    pub user_id: Option<String>,
    pub system_permissions: HashMap<String, bool>,
    pub object_permissions: HashMap<String, ObjectPermissions>,
    pub field_permissions: HashMap<String, HashMap<String, String>>,
    pub all_permissive: bool,
}

impl ResolvedPermissions {
    pub fn all_permissive() -> Self {
        Self {
            all_permissive: true,
            ..Default::default()
        }
    }

    pub fn has_system_permission(&self, name: &str) -> bool {
        self.all_permissive || self.system_permissions.get(name).copied().unwrap_or(false)
    }

    /// Object permissions for a collection; an absent entry behaves as NONE.
    pub fn object_permissions(&self, collection_id: &str) -> ObjectPermissions {
        self.object_permissions
            .get(collection_id)
            .copied()
            .unwrap_or(ObjectPermissions::NONE)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error("Authority request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Authority returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("Malformed authority response: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Authoritative source of a user's effective permissions.
#[async_trait]
pub trait PermissionAuthority: Send + Sync {
    async fn fetch(
        &self,
        tenant_id: &str,
        user_identity: &str,
    ) -> Result<ResolvedPermissions, AuthorityError>;
}

/// Fetches permissions from the worker's internal endpoint:
/// `GET {base}/internal/permissions?tenantId={t}&email={e}`.
pub struct HttpPermissionAuthority {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPermissionAuthority {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PermissionAuthority for HttpPermissionAuthority {
    async fn fetch(
        &self,
        tenant_id: &str,
        user_identity: &str,
    ) -> Result<ResolvedPermissions, AuthorityError> {
        let url = format!(
            "{}/internal/permissions",
            self.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .get(&url)
            .query(&[("tenantId", tenant_id), ("email", user_identity)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuthorityError::Status(response.status()));
        }

        let body = response.text().await?;
        let perms: ResolvedPermissions = serde_json::from_str(&body)?;
        debug!(
            tenant_id,
            user_identity,
            system = perms.system_permissions.len(),
            objects = perms.object_permissions.len(),
            "Fetched permissions from authority"
        );
        Ok(perms)
    }
}

/// Cache-aside permission resolution with an explicit fail-open policy:
/// any dependency failure yields an all-permissive result so a transient
/// outage does not lock out every tenant. Availability over strict denial.
pub struct PermissionResolver {
    cache: Arc<dyn CacheStore>,
    authority: Arc<dyn PermissionAuthority>,
    key_prefix: String,
    ttl: Duration,
}

impl PermissionResolver {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        authority: Arc<dyn PermissionAuthority>,
        key_prefix: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            cache,
            authority,
            key_prefix: key_prefix.into(),
            ttl,
        }
    }

    fn cache_key(&self, tenant_id: &str, user_identity: &str) -> String {
        format!("{}{}:{}", self.key_prefix, tenant_id, user_identity)
    }

    /// Resolve the snapshot for (tenant, user). Never fails: every error path
    /// degrades to `all_permissive` with a warning.
    pub async fn resolve(&self, tenant_id: &str, user_identity: &str) -> ResolvedPermissions {
        let key = self.cache_key(tenant_id, user_identity);

        match self.cache.get(&key).await {
            Ok(Some(json)) => match serde_json::from_str::<ResolvedPermissions>(&json) {
                Ok(perms) => {
                    debug!(tenant_id, user_identity, "Permission cache hit");
                    perms
                }
                Err(e) => {
                    warn!(tenant_id, user_identity, error = %e,
                        "Cached permissions undecodable, allowing request");
                    ResolvedPermissions::all_permissive()
                }
            },
            Ok(None) => self.fetch_and_cache(&key, tenant_id, user_identity).await,
            Err(e) => {
                warn!(tenant_id, user_identity, error = %e,
                    "Permission cache unavailable, allowing request");
                ResolvedPermissions::all_permissive()
            }
        }
    }

    async fn fetch_and_cache(
        &self,
        key: &str,
        tenant_id: &str,
        user_identity: &str,
    ) -> ResolvedPermissions {
        let perms = match self.authority.fetch(tenant_id, user_identity).await {
            Ok(perms) => perms,
            Err(e) => {
                warn!(tenant_id, user_identity, error = %e,
                    "Permission authority unavailable, allowing request");
                return ResolvedPermissions::all_permissive();
            }
        };

        // Cache-write failures are logged and ignored; the fetched result still stands.
        match serde_json::to_string(&perms) {
            Ok(json) => {
                if let Err(e) = self.cache.put(key, &json, self.ttl).await {
                    warn!(key, error = %e, "Failed to cache permissions");
                }
            }
            Err(e) => warn!(key, error = %e, "Failed to serialize permissions for caching"),
        }

        perms
    }

    /// Evict all cached permission entries for a tenant. An absent tenant id
    /// is a no-op; eviction failure never fails the triggering event path.
    pub async fn evict_tenant(&self, tenant_id: Option<&str>) {
        let Some(tenant_id) = tenant_id else {
            return;
        };
        let prefix = format!("{}{}:", self.key_prefix, tenant_id);
        match self.cache.delete_prefix(&prefix).await {
            Ok(count) if count > 0 => {
                info!(tenant_id, count, "Evicted permission cache entries")
            }
            Ok(_) => {}
            Err(e) => warn!(tenant_id, error = %e, "Failed to evict permission cache"),
        }
    }
}
