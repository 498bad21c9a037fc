use crate::bootstrap::{CONTROL_PLANE_ROUTE_ID, RESERVED_NAME_PREFIX};
use crate::cache::CacheStore;
use crate::permissions::PermissionResolver;
use crate::policy::{roles_from_rules_json, AuthzConfig, FieldPolicy, PolicyStore, RoutePolicy};
use crate::routes::{RouteDefinition, RouteRegistry};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Collections whose records feed permission resolution. A write to any of
/// them invalidates the affected tenant's cached permission snapshots.
const PERMISSION_COLLECTIONS: &[&str] = &[
    "profiles",
    "permission-sets",
    "profile-system-permissions",
    "profile-object-permissions",
    "profile-field-permissions",
    "permset-system-permissions",
    "permset-object-permissions",
    "permset-field-permissions",
    "user-permission-sets",
    "group-permission-sets",
    "user-groups",
    "group-memberships",
    "users",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

/// Configuration-change notifications published by the control plane.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ConfigEvent {
    CollectionChanged {
        id: String,
        name: String,
        change_type: ChangeType,
    },
    WorkerAssignmentChanged {
        worker_id: String,
        collection_id: String,
        collection_name: String,
        worker_base_url: Option<String>,
        change_type: ChangeType,
    },
    RecordChanged {
        collection_name: String,
        record_id: Option<String>,
        change_type: ChangeType,
        tenant_id: Option<String>,
    },
    AuthzChanged {
        collection_id: String,
        #[serde(default)]
        route_policies: Vec<RoutePolicyPayload>,
        #[serde(default)]
        field_policies: Vec<FieldPolicyPayload>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePolicyPayload {
    pub operation: String,
    pub policy_id: String,
    #[serde(default)]
    pub policy_rules: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldPolicyPayload {
    pub field_name: String,
    pub policy_id: String,
    #[serde(default)]
    pub policy_rules: Option<String>,
}

/// Applies control-plane change events to the in-memory route table, policy
/// store and caches. Each event is handled independently; a malformed payload
/// is logged and dropped without disturbing previously applied state.
pub struct EventIngestor {
    registry: Arc<RouteRegistry>,
    policies: Arc<PolicyStore>,
    cache: Arc<dyn CacheStore>,
    resolver: Arc<PermissionResolver>,
    resource_prefix: String,
    refresh_tx: mpsc::Sender<()>,
}

impl EventIngestor {
    pub fn new(
        registry: Arc<RouteRegistry>,
        policies: Arc<PolicyStore>,
        cache: Arc<dyn CacheStore>,
        resolver: Arc<PermissionResolver>,
        resource_prefix: impl Into<String>,
        refresh_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            registry,
            policies,
            cache,
            resolver,
            resource_prefix: resource_prefix.into(),
            refresh_tx,
        }
    }

    /// Parse and apply one event payload.
    pub async fn apply(&self, payload: &str) {
        let event: ConfigEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Dropping malformed config event");
                return;
            }
        };

        match event {
            ConfigEvent::CollectionChanged {
                id,
                name,
                change_type,
            } => self.handle_collection_changed(&id, &name, change_type),
            ConfigEvent::WorkerAssignmentChanged {
                worker_id,
                collection_id,
                collection_name,
                worker_base_url,
                change_type,
            } => self.handle_worker_assignment(
                &worker_id,
                &collection_id,
                &collection_name,
                worker_base_url.as_deref(),
                change_type,
            ),
            ConfigEvent::RecordChanged {
                collection_name,
                record_id,
                change_type,
                tenant_id,
            } => {
                self.handle_record_changed(
                    &collection_name,
                    record_id.as_deref(),
                    change_type,
                    tenant_id.as_deref(),
                )
                .await
            }
            ConfigEvent::AuthzChanged {
                collection_id,
                route_policies,
                field_policies,
            } => self.handle_authz_changed(&collection_id, route_policies, field_policies),
        }
    }

    fn handle_collection_changed(&self, id: &str, name: &str, change_type: ChangeType) {
        if is_reserved(id, name) {
            warn!(id, name, "Ignoring change event for reserved collection");
            return;
        }

        match change_type {
            ChangeType::Deleted => {
                self.registry.remove(id);
                self.policies.remove(id);
            }
            ChangeType::Created | ChangeType::Updated => {
                // The event carries no backend address. Refresh the route's
                // name and pattern if one exists; otherwise a later worker
                // assignment will create it.
                match self.registry.find_by_id(id) {
                    Some(existing) => self.registry.upsert(RouteDefinition::new(
                        id,
                        collection_pattern(name),
                        existing.backend_base_url,
                        name,
                    )),
                    None => {
                        debug!(id, name, "Collection has no route yet, awaiting worker assignment")
                    }
                }
            }
        }
    }

    fn handle_worker_assignment(
        &self,
        worker_id: &str,
        collection_id: &str,
        collection_name: &str,
        worker_base_url: Option<&str>,
        change_type: ChangeType,
    ) {
        if is_reserved(collection_id, collection_name) {
            warn!(
                collection_id,
                collection_name, "Ignoring assignment event for reserved collection"
            );
            return;
        }

        match change_type {
            ChangeType::Deleted => self.registry.remove(collection_id),
            ChangeType::Created | ChangeType::Updated => match worker_base_url {
                Some(url) if !url.is_empty() => {
                    info!(worker_id, collection_id, url, "Applying worker assignment");
                    self.registry.upsert(RouteDefinition::new(
                        collection_id,
                        collection_pattern(collection_name),
                        url,
                        collection_name,
                    ));
                }
                _ => warn!(
                    worker_id,
                    collection_id, "Assignment event without a worker base URL, skipping"
                ),
            },
        }
    }

    async fn handle_record_changed(
        &self,
        collection_name: &str,
        record_id: Option<&str>,
        change_type: ChangeType,
        tenant_id: Option<&str>,
    ) {
        debug!(collection_name, ?change_type, "Record changed");

        // A write to the collections collection means routing metadata moved
        // under us; schedule a full configuration refresh.
        if collection_name == "collections" && self.refresh_tx.try_send(()).is_err() {
            debug!("Configuration refresh already pending");
        }

        if let Some(id) = record_id {
            let key = format!("{}{}:{}", self.resource_prefix, collection_name, id);
            if let Err(e) = self.cache.delete(&key).await {
                warn!(%key, error = %e, "Failed to evict cached resource");
            }
        }

        if PERMISSION_COLLECTIONS.contains(&collection_name) {
            self.resolver.evict_tenant(tenant_id).await;
        }
    }

    fn handle_authz_changed(
        &self,
        collection_id: &str,
        route_policies: Vec<RoutePolicyPayload>,
        field_policies: Vec<FieldPolicyPayload>,
    ) {
        if collection_id == CONTROL_PLANE_ROUTE_ID {
            warn!(collection_id, "Ignoring authz event for reserved collection");
            return;
        }

        let route_policies = route_policies
            .into_iter()
            .map(|p| {
                let roles = p
                    .policy_rules
                    .as_deref()
                    .map(roles_from_rules_json)
                    .unwrap_or_default();
                RoutePolicy::new(p.operation, p.policy_id, roles)
            })
            .collect();
        let field_policies = field_policies
            .into_iter()
            .map(|p| {
                let roles = p
                    .policy_rules
                    .as_deref()
                    .map(roles_from_rules_json)
                    .unwrap_or_default();
                FieldPolicy::new(p.field_name, p.policy_id, roles)
            })
            .collect();

        match AuthzConfig::new(collection_id, route_policies, field_policies) {
            Ok(config) => {
                info!(collection_id, "Applied authorization update");
                self.policies.update(config);
            }
            Err(e) => warn!(collection_id, error = %e, "Dropping invalid authz event"),
        }
    }

    /// Subscribe to the configuration channel and apply events until the
    /// process exits. Dropped connections are retried with a fixed backoff.
    pub async fn run(self: Arc<Self>, redis_url: String, channel: String) {
        loop {
            match self.subscribe_once(&redis_url, &channel).await {
                Ok(()) => warn!(channel, "Event subscription ended, reconnecting"),
                Err(e) => error!(channel, error = %e, "Event subscription failed, reconnecting"),
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    async fn subscribe_once(&self, redis_url: &str, channel: &str) -> Result<(), redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        info!(channel, "Subscribed to configuration events");

        let mut messages = pubsub.on_message();
        while let Some(message) = futures::StreamExt::next(&mut messages).await {
            match message.get_payload::<String>() {
                Ok(payload) => self.apply(&payload).await,
                Err(e) => warn!(error = %e, "Skipping unreadable event payload"),
            }
        }
        Ok(())
    }
}

fn is_reserved(collection_id: &str, collection_name: &str) -> bool {
    collection_id == CONTROL_PLANE_ROUTE_ID || collection_name.starts_with(RESERVED_NAME_PREFIX)
}

/// Request path pattern serving a collection's resources.
pub fn collection_pattern(collection_name: &str) -> String {
    format!("/api/{collection_name}/**")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::permissions::{
        AuthorityError, PermissionAuthority, ResolvedPermissions,
    };
    use async_trait::async_trait;

    struct StubAuthority;

    #[async_trait]
    impl PermissionAuthority for StubAuthority {
        async fn fetch(
            &self,
            _tenant_id: &str,
            _user_identity: &str,
        ) -> Result<ResolvedPermissions, AuthorityError> {
            Ok(ResolvedPermissions::default())
        }
    }

    struct Fixture {
        ingestor: EventIngestor,
        registry: Arc<RouteRegistry>,
        policies: Arc<PolicyStore>,
        cache: Arc<MemoryCache>,
        refresh_rx: mpsc::Receiver<()>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(RouteRegistry::new());
        let policies = Arc::new(PolicyStore::new());
        let cache = Arc::new(MemoryCache::new());
        let resolver = Arc::new(PermissionResolver::new(
            cache.clone() as Arc<dyn CacheStore>,
            Arc::new(StubAuthority),
            "permissions:",
            Duration::from_secs(300),
        ));
        let (refresh_tx, refresh_rx) = mpsc::channel(1);
        let ingestor = EventIngestor::new(
            registry.clone(),
            policies.clone(),
            cache.clone() as Arc<dyn CacheStore>,
            resolver,
            "resource:",
            refresh_tx,
        );
        Fixture {
            ingestor,
            registry,
            policies,
            cache,
            refresh_rx,
        }
    }

    #[tokio::test]
    async fn test_worker_assignment_creates_route() {
        let f = fixture();
        f.ingestor
            .apply(
                r#"{"kind":"worker-assignment-changed","workerId":"w1","collectionId":"c1",
                    "collectionName":"orders","workerBaseUrl":"http://worker-1:9000",
                    "changeType":"CREATED"}"#,
            )
            .await;

        let route = f.registry.find_by_collection_name("orders").expect("route");
        assert_eq!(route.id, "c1");
        assert_eq!(route.path_pattern, "/api/orders/**");
        assert_eq!(route.backend_base_url, "http://worker-1:9000");
    }

    #[tokio::test]
    async fn test_assignment_without_base_url_is_skipped() {
        let f = fixture();
        f.ingestor
            .apply(
                r#"{"kind":"worker-assignment-changed","workerId":"w1","collectionId":"c1",
                    "collectionName":"orders","workerBaseUrl":null,"changeType":"CREATED"}"#,
            )
            .await;
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_collection_deleted_removes_route_and_policies() {
        let f = fixture();
        f.registry.upsert(RouteDefinition::new(
            "c1",
            "/api/orders/**",
            "http://worker-1:9000",
            "orders",
        ));
        f.policies
            .update(AuthzConfig::new("c1", vec![], vec![]).unwrap());

        f.ingestor
            .apply(r#"{"kind":"collection-changed","id":"c1","name":"orders","changeType":"DELETED"}"#)
            .await;

        assert!(f.registry.is_empty());
        assert!(f.policies.get("c1").is_none());
    }

    #[tokio::test]
    async fn test_collection_rename_keeps_backend() {
        let f = fixture();
        f.registry.upsert(RouteDefinition::new(
            "c1",
            "/api/orders/**",
            "http://worker-1:9000",
            "orders",
        ));

        f.ingestor
            .apply(
                r#"{"kind":"collection-changed","id":"c1","name":"purchases","changeType":"UPDATED"}"#,
            )
            .await;

        let route = f.registry.find_by_collection_name("purchases").expect("route");
        assert_eq!(route.path_pattern, "/api/purchases/**");
        assert_eq!(route.backend_base_url, "http://worker-1:9000");
    }

    #[tokio::test]
    async fn test_reserved_collection_events_are_ignored() {
        let f = fixture();
        f.ingestor
            .apply(&format!(
                r#"{{"kind":"worker-assignment-changed","workerId":"w1",
                    "collectionId":"{CONTROL_PLANE_ROUTE_ID}","collectionName":"sneaky",
                    "workerBaseUrl":"http://evil:9000","changeType":"CREATED"}}"#
            ))
            .await;
        f.ingestor
            .apply(
                r#"{"kind":"worker-assignment-changed","workerId":"w1","collectionId":"c9",
                    "collectionName":"__system","workerBaseUrl":"http://evil:9000",
                    "changeType":"CREATED"}"#,
            )
            .await;
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_record_changed_evicts_resource_and_permissions() {
        let f = fixture();
        f.cache
            .put("resource:orders:5", "{}", Duration::from_secs(60))
            .await
            .unwrap();
        f.cache
            .put("permissions:t1:bob@example.com", "{}", Duration::from_secs(60))
            .await
            .unwrap();

        f.ingestor
            .apply(
                r#"{"kind":"record-changed","collectionName":"orders","recordId":"5",
                    "changeType":"UPDATED","tenantId":"t1"}"#,
            )
            .await;
        assert!(f.cache.get("resource:orders:5").await.unwrap().is_none());
        // orders is not a permission collection, the snapshot survives
        assert!(f
            .cache
            .get("permissions:t1:bob@example.com")
            .await
            .unwrap()
            .is_some());

        f.ingestor
            .apply(
                r#"{"kind":"record-changed","collectionName":"users","recordId":"u1",
                    "changeType":"UPDATED","tenantId":"t1"}"#,
            )
            .await;
        assert!(f
            .cache
            .get("permissions:t1:bob@example.com")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_collections_record_change_requests_refresh() {
        let mut f = fixture();
        f.ingestor
            .apply(
                r#"{"kind":"record-changed","collectionName":"collections","recordId":"c2",
                    "changeType":"CREATED","tenantId":null}"#,
            )
            .await;
        assert!(f.refresh_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_authz_changed_installs_policies() {
        let f = fixture();
        f.ingestor
            .apply(
                r#"{"kind":"authz-changed","collectionId":"c1",
                    "routePolicies":[{"operation":"GET","policyId":"p1",
                        "policyRules":"{\"roles\":[\"viewer\",\"admin\"]}"}],
                    "fieldPolicies":[{"fieldName":"salary","policyId":"p2",
                        "policyRules":"{\"roles\":[\"hr\"]}"}]}"#,
            )
            .await;

        let config = f.policies.get("c1").expect("config");
        let route = config.route_policy("get").expect("route policy");
        assert!(route.roles.contains("viewer"));
        assert_eq!(config.field_policies().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_event_is_dropped() {
        let f = fixture();
        f.ingestor.apply("not json").await;
        f.ingestor.apply(r#"{"kind":"mystery-event"}"#).await;
        assert!(f.registry.is_empty());
        assert!(f.policies.is_empty());
    }
}
