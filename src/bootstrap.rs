use crate::errors::GatewayError;
use crate::events::{collection_pattern, FieldPolicyPayload, RoutePolicyPayload};
use crate::policy::{roles_from_rules_json, AuthzConfig, FieldPolicy, PolicyStore, RoutePolicy};
use crate::routes::{RouteDefinition, RouteRegistry};
use crate::settings::Settings;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Well-known id of the statically provisioned control-plane route.
/// Events naming it are rejected so stray messages cannot hijack the route.
pub const CONTROL_PLANE_ROUTE_ID: &str = "00000000-0000-0000-0000-000000000100";
pub const CONTROL_PLANE_PATTERN: &str = "/control/**";
pub const CONTROL_PLANE_NAME: &str = "__control-plane";
/// Collections whose names start with this prefix are system-owned.
pub const RESERVED_NAME_PREFIX: &str = "__";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BootstrapConfig {
    #[serde(default)]
    collections: Vec<CollectionEntry>,
    #[serde(default)]
    authorization: Option<AuthorizationSection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionEntry {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    worker_base_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizationSection {
    #[serde(default)]
    collection_authz: Vec<CollectionAuthzEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionAuthzEntry {
    collection_id: String,
    #[serde(default)]
    route_policies: Vec<RoutePolicyPayload>,
    #[serde(default)]
    field_policies: Vec<FieldPolicyPayload>,
}

/// Startup provisioning: static system routes plus an initial fetch of
/// collection routes and authorization config from the control plane.
pub struct BootstrapService {
    settings: Arc<Settings>,
    client: reqwest::Client,
    registry: Arc<RouteRegistry>,
    policies: Arc<PolicyStore>,
}

impl BootstrapService {
    pub fn new(
        settings: Arc<Settings>,
        client: reqwest::Client,
        registry: Arc<RouteRegistry>,
        policies: Arc<PolicyStore>,
    ) -> Self {
        Self {
            settings,
            client,
            registry,
            policies,
        }
    }

    /// Provision routes that exist independently of control-plane state.
    pub fn register_static_routes(&self) {
        self.registry.upsert(RouteDefinition::new(
            CONTROL_PLANE_ROUTE_ID,
            CONTROL_PLANE_PATTERN,
            self.settings.control_plane.url.clone(),
            CONTROL_PLANE_NAME,
        ));
    }

    /// Static routes first, then the control-plane fetch. A bootstrap outage
    /// is logged and survived; the event stream converges the state later.
    pub async fn initialize(&self) {
        self.register_static_routes();
        match self.refresh_routes().await {
            Ok(()) => info!(routes = self.registry.len(), "Bootstrap complete"),
            Err(e) => error!(error = %e, "Bootstrap fetch failed, continuing with static routes"),
        }
    }

    /// Fetch the current collection and authorization configuration from the
    /// control plane and apply it.
    pub async fn refresh_routes(&self) -> Result<(), GatewayError> {
        let url = format!(
            "{}{}",
            self.settings.control_plane.url.trim_end_matches('/'),
            self.settings.control_plane.bootstrap_path
        );
        let config: BootstrapConfig = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        self.apply_config(config);
        Ok(())
    }

    fn apply_config(&self, config: BootstrapConfig) {
        for collection in config.collections {
            if collection.id.is_empty() || collection.name.is_empty() {
                warn!(id = %collection.id, name = %collection.name,
                    "Skipping bootstrap collection with missing id or name");
                continue;
            }
            if collection.id == CONTROL_PLANE_ROUTE_ID
                || collection.name.starts_with(RESERVED_NAME_PREFIX)
            {
                warn!(id = %collection.id, name = %collection.name,
                    "Skipping reserved bootstrap collection");
                continue;
            }

            let pattern = collection
                .path
                .as_deref()
                .and_then(normalize_pattern)
                .unwrap_or_else(|| collection_pattern(&collection.name));
            let backend = collection
                .worker_base_url
                .filter(|url| !url.is_empty())
                .unwrap_or_else(|| self.settings.authority.url.clone());

            self.registry.upsert(RouteDefinition::new(
                collection.id,
                pattern,
                backend,
                collection.name,
            ));
        }

        let Some(authorization) = config.authorization else {
            return;
        };
        for entry in authorization.collection_authz {
            let route_policies = entry
                .route_policies
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
            let field_policies = entry
                .field_policies
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

            match AuthzConfig::new(&entry.collection_id, route_policies, field_policies) {
                Ok(config) => self.policies.update(config),
                Err(e) => warn!(collection_id = %entry.collection_id, error = %e,
                    "Skipping invalid bootstrap authz entry"),
            }
        }
    }
}

/// Normalize a configured collection path into a matchable pattern:
/// leading slash enforced, and a bare prefix becomes a `/**` suffix match.
fn normalize_pattern(path: &str) -> Option<String> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    let mut pattern = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    if !pattern.contains('*') {
        pattern = format!("{}/**", pattern.trim_end_matches('/'));
    }
    Some(pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(registry: Arc<RouteRegistry>, policies: Arc<PolicyStore>) -> BootstrapService {
        BootstrapService::new(
            Arc::new(Settings::default()),
            reqwest::Client::new(),
            registry,
            policies,
        )
    }

    #[test]
    fn test_normalize_pattern() {
        assert_eq!(normalize_pattern("/api/orders"), Some("/api/orders/**".into()));
        assert_eq!(normalize_pattern("api/orders/"), Some("/api/orders/**".into()));
        assert_eq!(normalize_pattern("/api/orders/**"), Some("/api/orders/**".into()));
        assert_eq!(normalize_pattern("/api/orders/*"), Some("/api/orders/*".into()));
        assert_eq!(normalize_pattern("  "), None);
    }

    #[test]
    fn test_static_routes_registered() {
        let registry = Arc::new(RouteRegistry::new());
        let service = service(registry.clone(), Arc::new(PolicyStore::new()));
        service.register_static_routes();

        let route = registry.find_by_path("/control/bootstrap").expect("route");
        assert_eq!(route.id, CONTROL_PLANE_ROUTE_ID);
        assert_eq!(route.collection_name, CONTROL_PLANE_NAME);
    }

    #[test]
    fn test_apply_config_upserts_routes_and_policies() {
        let registry = Arc::new(RouteRegistry::new());
        let policies = Arc::new(PolicyStore::new());
        let service = service(registry.clone(), policies.clone());

        let config: BootstrapConfig = serde_json::from_str(
            r#"{
                "collections": [
                    {"id":"c1","name":"orders","path":"/api/orders",
                     "workerBaseUrl":"http://worker-1:9000"},
                    {"id":"c2","name":"users","path":null,"workerBaseUrl":null},
                    {"id":"","name":"broken"},
                    {"id":"c3","name":"__system"}
                ],
                "authorization": {
                    "collectionAuthz": [
                        {"collectionId":"c1",
                         "routePolicies":[{"operation":"GET","policyId":"p1",
                            "policyRules":"{\"roles\":[\"viewer\"]}"}]}
                    ]
                }
            }"#,
        )
        .unwrap();
        service.apply_config(config);

        let orders = registry.find_by_id("c1").expect("orders route");
        assert_eq!(orders.path_pattern, "/api/orders/**");
        assert_eq!(orders.backend_base_url, "http://worker-1:9000");

        // no assigned worker: the configured default backend applies
        let users = registry.find_by_id("c2").expect("users route");
        assert_eq!(users.path_pattern, "/api/users/**");
        assert_eq!(users.backend_base_url, Settings::default().authority.url);

        // invalid and reserved entries are skipped, static control route aside
        assert_eq!(registry.len(), 2);

        let authz = policies.get("c1").expect("authz config");
        assert!(authz.route_policy("GET").unwrap().roles.contains("viewer"));
    }
}
