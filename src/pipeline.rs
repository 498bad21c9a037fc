use crate::permissions::{PermissionResolver, ResolvedPermissions};
use crate::principal::GatewayPrincipal;
use crate::routes::{RouteDefinition, RouteRegistry};
use crate::settings::Settings;
use async_trait::async_trait;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::{debug, warn};

pub const API_ACCESS: &str = "API_ACCESS";
pub const VIEW_ALL_DATA: &str = "VIEW_ALL_DATA";
pub const MODIFY_ALL_DATA: &str = "MODIFY_ALL_DATA";

/// Per-request state threaded through the pipeline. Stages only ever add
/// to it; the handler reads the accumulated route and permissions afterwards.
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub principal: Option<GatewayPrincipal>,
    pub tenant_id: Option<String>,
    pub permissions: Option<ResolvedPermissions>,
    pub route: Option<RouteDefinition>,
}

impl RequestContext {
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        principal: Option<GatewayPrincipal>,
        tenant_id: Option<String>,
    ) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            principal,
            tenant_id,
            permissions: None,
            route: None,
        }
    }
}

pub enum StageOutcome {
    Continue,
    Halt(Response),
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, ctx: &mut RequestContext) -> StageOutcome;
}

/// Fixed-order stage sequence. The order is the vector order given at
/// construction; nothing can reorder stages after the fact.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// Run every stage in order. Returns the halting response, if any.
    pub async fn run(&self, ctx: &mut RequestContext) -> Option<Response> {
        for stage in &self.stages {
            match stage.process(ctx).await {
                StageOutcome::Continue => {}
                StageOutcome::Halt(response) => {
                    debug!(stage = stage.name(), path = %ctx.path, "Pipeline halted");
                    return Some(response);
                }
            }
        }
        None
    }
}

/// Structured 403 error document returned on every denial.
pub fn forbidden(path: &str, detail: &str) -> Response {
    let body = serde_json::json!({
        "errors": [{
            "status": "403",
            "code": "FORBIDDEN",
            "detail": detail,
            "meta": { "path": path },
        }]
    });
    (
        StatusCode::FORBIDDEN,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Attaches the caller's resolved permission snapshot to the context.
/// Never denies by itself; every shortcut here leaves the decision to the
/// authorization stage.
pub struct PermissionResolutionStage {
    settings: Arc<Settings>,
    resolver: Arc<PermissionResolver>,
}

impl PermissionResolutionStage {
    pub fn new(settings: Arc<Settings>, resolver: Arc<PermissionResolver>) -> Self {
        Self { settings, resolver }
    }
}

#[async_trait]
impl Stage for PermissionResolutionStage {
    fn name(&self) -> &'static str {
        "permission-resolution"
    }

    async fn process(&self, ctx: &mut RequestContext) -> StageOutcome {
        if !self.settings.security.permissions_enabled
            || self.settings.is_public_path(&ctx.path)
        {
            return StageOutcome::Continue;
        }
        let principal = match &ctx.principal {
            Some(principal) => principal,
            None => return StageOutcome::Continue,
        };

        if principal.has_role(&self.settings.security.platform_admin_role) {
            debug!(subject = %principal.subject_id, "Platform admin, skipping resolution");
            ctx.permissions = Some(ResolvedPermissions::all_permissive());
            return StageOutcome::Continue;
        }

        let tenant_id = match &ctx.tenant_id {
            Some(tenant_id) => tenant_id.clone(),
            None => {
                // Without a tenant there is nothing to resolve against;
                // the authorization stage fails open in this case.
                debug!(subject = %principal.subject_id, "No tenant in context");
                return StageOutcome::Continue;
            }
        };

        let subject = principal.subject_id.clone();
        ctx.permissions = Some(self.resolver.resolve(&tenant_id, &subject).await);
        StageOutcome::Continue
    }
}

/// Route-level allow/deny. Public paths bypass everything; beyond that an
/// authenticated principal is required, and with enforcement enabled the
/// request's HTTP method is checked against the matched route's collection
/// permissions.
pub struct RouteAuthorizationStage {
    settings: Arc<Settings>,
    registry: Arc<RouteRegistry>,
}

impl RouteAuthorizationStage {
    pub fn new(settings: Arc<Settings>, registry: Arc<RouteRegistry>) -> Self {
        Self { settings, registry }
    }
}

#[async_trait]
impl Stage for RouteAuthorizationStage {
    fn name(&self) -> &'static str {
        "route-authorization"
    }

    async fn process(&self, ctx: &mut RequestContext) -> StageOutcome {
        if self.settings.is_public_path(&ctx.path) {
            return StageOutcome::Continue;
        }

        let principal = match &ctx.principal {
            Some(principal) => principal,
            None => {
                return StageOutcome::Halt(forbidden(&ctx.path, "Authentication required"));
            }
        };

        // Authentication-only mode
        if !self.settings.security.permissions_enabled {
            return StageOutcome::Continue;
        }

        let permissions = match &ctx.permissions {
            Some(permissions) => permissions,
            // Resolution could not run (no tenant in context). The resolver
            // already fails open on dependency errors; the same policy
            // applies here.
            None => {
                warn!(path = %ctx.path, subject = %principal.subject_id,
                    "No permission context, allowing through");
                return StageOutcome::Continue;
            }
        };

        if permissions.all_permissive {
            return StageOutcome::Continue;
        }

        if !permissions.has_system_permission(API_ACCESS) {
            if ctx.path.starts_with(&self.settings.security.api_prefix) {
                return StageOutcome::Halt(forbidden(&ctx.path, "API access is not permitted"));
            }
            // Operational endpoints outside the collection namespace
            return StageOutcome::Continue;
        }

        let route = match self.registry.find_by_path(&ctx.path) {
            Some(route) => route,
            // No route means no object-permission context to deny against
            None => return StageOutcome::Continue,
        };

        // Capability bit first; on denial, read methods fall back to the
        // VIEW_ALL_DATA override and every write method to MODIFY_ALL_DATA.
        let object = permissions.object_permissions(&route.id);
        let allowed = match ctx.method.to_ascii_uppercase().as_str() {
            "GET" | "HEAD" | "OPTIONS" => {
                object.can_read || permissions.has_system_permission(VIEW_ALL_DATA)
            }
            "POST" => object.can_create || permissions.has_system_permission(MODIFY_ALL_DATA),
            "PUT" | "PATCH" => {
                object.can_edit || permissions.has_system_permission(MODIFY_ALL_DATA)
            }
            "DELETE" => {
                object.can_delete || permissions.has_system_permission(MODIFY_ALL_DATA)
            }
            _ => false,
        };

        if allowed {
            ctx.route = Some(route);
            StageOutcome::Continue
        } else {
            warn!(path = %ctx.path, method = %ctx.method, collection = %route.id,
                subject = %principal.subject_id, "Denied by object permissions");
            StageOutcome::Halt(forbidden(
                &ctx.path,
                &format!("{} is not permitted on this collection", ctx.method),
            ))
        }
    }
}
