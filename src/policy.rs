use crate::errors::GatewayError;
use crate::principal::GatewayPrincipal;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// Roles permitted for one HTTP method on a collection's routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePolicy {
    pub http_method: String,
    pub policy_id: String,
    pub roles: HashSet<String>,
}

impl RoutePolicy {
    pub fn new(
        http_method: impl Into<String>,
        policy_id: impl Into<String>,
        roles: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            http_method: http_method.into(),
            policy_id: policy_id.into(),
            roles: roles.into_iter().collect(),
        }
    }
}

/// Roles permitted to see one field of a collection's resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPolicy {
    pub field_name: String,
    pub policy_id: String,
    pub roles: HashSet<String>,
}

impl FieldPolicy {
    pub fn new(
        field_name: impl Into<String>,
        policy_id: impl Into<String>,
        roles: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            policy_id: policy_id.into(),
            roles: roles.into_iter().collect(),
        }
    }
}

/// Immutable per-collection authorization configuration.
#[derive(Debug, Clone)]
pub struct AuthzConfig {
    collection_id: String,
    route_policies: Vec<RoutePolicy>,
    field_policies: Vec<FieldPolicy>,
}

impl AuthzConfig {
    /// Construction fails on a missing collection id; the policy lists may be empty.
    pub fn new(
        collection_id: impl Into<String>,
        route_policies: Vec<RoutePolicy>,
        field_policies: Vec<FieldPolicy>,
    ) -> Result<Self, GatewayError> {
        let collection_id = collection_id.into();
        if collection_id.is_empty() {
            return Err(GatewayError::InvalidConfig(
                "authz config requires a collection id".to_string(),
            ));
        }
        Ok(Self {
            collection_id,
            route_policies,
            field_policies,
        })
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    pub fn route_policy(&self, http_method: &str) -> Option<&RoutePolicy> {
        self.route_policies
            .iter()
            .find(|p| p.http_method.eq_ignore_ascii_case(http_method))
    }

    pub fn field_policies(&self) -> &[FieldPolicy] {
        &self.field_policies
    }
}

/// Role set shared by both policy kinds; evaluation acceptance is identical.
pub trait RolePolicy {
    fn roles(&self) -> &HashSet<String>;
}

impl RolePolicy for RoutePolicy {
    fn roles(&self) -> &HashSet<String> {
        &self.roles
    }
}

impl RolePolicy for FieldPolicy {
    fn roles(&self) -> &HashSet<String> {
        &self.roles
    }
}

/// Role-membership predicate: false when either side is absent, true when the
/// policy names no roles, otherwise true iff the principal holds at least one
/// named role. Matching is case-sensitive with no normalization.
pub fn evaluate<P: RolePolicy>(
    policy: Option<&P>,
    principal: Option<&GatewayPrincipal>,
) -> bool {
    let (Some(policy), Some(principal)) = (policy, principal) else {
        return false;
    };
    if policy.roles().is_empty() {
        return true;
    }
    principal.roles.iter().any(|r| policy.roles().contains(r))
}

/// Per-collection policy table, mutated by the event ingestor and bootstrap
/// warm-up while request threads read it.
#[derive(Default)]
pub struct PolicyStore {
    by_collection: DashMap<String, Arc<AuthzConfig>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, config: AuthzConfig) {
        self.by_collection
            .insert(config.collection_id().to_string(), Arc::new(config));
    }

    pub fn remove(&self, collection_id: &str) {
        self.by_collection.remove(collection_id);
    }

    pub fn get(&self, collection_id: &str) -> Option<Arc<AuthzConfig>> {
        self.by_collection
            .get(collection_id)
            .map(|e| Arc::clone(e.value()))
    }

    pub fn len(&self) -> usize {
        self.by_collection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_collection.is_empty()
    }
}

/// Extract role names from a `policyRules` JSON blob of shape `{"roles": [...]}`.
/// Unparseable blobs degrade to an empty role list with a warning.
pub fn roles_from_rules_json(rules_json: &str) -> Vec<String> {
    if rules_json.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<serde_json::Value>(rules_json) {
        Ok(value) => match value.get("roles").and_then(|r| r.as_array()) {
            Some(items) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            None => {
                warn!(rules = rules_json, "Policy rules have no 'roles' list");
                Vec::new()
            }
        },
        Err(e) => {
            warn!(rules = rules_json, error = %e, "Failed to parse policy rules JSON");
            Vec::new()
        }
    }
}
