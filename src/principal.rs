use axum::http::HeaderMap;
use serde_json::Value;
use std::collections::HashMap;

/// Header set by the upstream authentication layer. The gateway trusts these
/// headers; it never validates credentials itself.
pub const SUBJECT_HEADER: &str = "x-waypoint-subject";
pub const ROLES_HEADER: &str = "x-waypoint-roles";
pub const TENANT_HEADER: &str = "x-waypoint-tenant";
pub const CLAIMS_HEADER: &str = "x-waypoint-claims";

/// Authenticated caller identity, produced upstream and read-only here.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayPrincipal {
    pub subject_id: String,
    pub roles: Vec<String>,
    pub claims: HashMap<String, Value>,
}

impl GatewayPrincipal {
    pub fn new(subject_id: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            roles,
            claims: HashMap::new(),
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Extract the principal from trusted upstream headers.
    /// Returns None when no subject header is present (unauthenticated request).
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let subject = headers.get(SUBJECT_HEADER)?.to_str().ok()?.trim();
        if subject.is_empty() {
            return None;
        }

        let roles = headers
            .get(ROLES_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let claims = headers
            .get(CLAIMS_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| serde_json::from_str::<HashMap<String, Value>>(v).ok())
            .unwrap_or_default();

        Some(Self {
            subject_id: subject.to_string(),
            roles,
            claims,
        })
    }
}

/// Extract the tenant id from trusted upstream headers.
pub fn tenant_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}
