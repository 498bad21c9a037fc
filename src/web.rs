use crate::include::{splice_included, IncludeResolver};
use crate::jsonapi::Document;
use crate::pipeline::{Pipeline, RequestContext};
use crate::policy::{evaluate, PolicyStore};
use crate::principal::{tenant_from_headers, GatewayPrincipal};
use crate::routes::RouteRegistry;
use crate::settings::Settings;
use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use miette::IntoDiagnostic;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Headers that must not be forwarded in either direction.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: Arc<RouteRegistry>,
    pub policies: Arc<PolicyStore>,
    pub pipeline: Arc<Pipeline>,
    pub includes: Arc<IncludeResolver>,
    pub client: reqwest::Client,
}

pub async fn serve(state: AppState) -> miette::Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    )
    .parse()
    .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    let router = Router::new()
        .route("/health", get(health))
        .fallback(gateway)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!(%addr, "Gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await.into_diagnostic()?;
    axum::serve(listener, router).await.into_diagnostic()?;
    Ok(())
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "routes": state.registry.len() }))
}

/// Fallback handler: every non-system request runs the decision pipeline and,
/// if allowed, is proxied byte-for-byte to the owning backend. The response
/// path optionally expands includes and strips unauthorized fields.
async fn gateway(State(state): State<AppState>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    let principal = GatewayPrincipal::from_headers(&parts.headers);
    let tenant_id = tenant_from_headers(&parts.headers);

    let mut ctx = RequestContext::new(parts.method.as_str(), &path, principal, tenant_id);
    if let Some(response) = state.pipeline.run(&mut ctx).await {
        return response;
    }

    let route = match ctx.route.take().or_else(|| state.registry.find_by_path(&path)) {
        Some(route) => route,
        None => {
            debug!(%path, "No route for path");
            return error_document(
                StatusCode::NOT_FOUND,
                "ROUTE_NOT_FOUND",
                "No backend is registered for this path",
                &path,
            );
        }
    };

    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            warn!(%path, error = %e, "Failed to read request body");
            return error_document(
                StatusCode::BAD_REQUEST,
                "BAD_REQUEST",
                "Request body could not be read",
                &path,
            );
        }
    };

    let target = format!(
        "{}{}",
        route.backend_base_url.trim_end_matches('/'),
        path_and_query
    );
    let upstream = state
        .client
        .request(parts.method.clone(), &target)
        .headers(forwardable_headers(&parts.headers))
        .body(body)
        .send()
        .await;

    let upstream = match upstream {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(%target, error = %e, "Backend request failed");
            return error_document(
                StatusCode::BAD_GATEWAY,
                "BAD_GATEWAY",
                "The backend for this route is unreachable",
                &path,
            );
        }
    };

    let status = upstream.status();
    let headers = forwardable_headers(upstream.headers());
    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(%target, error = %e, "Failed to read backend response");
            return error_document(
                StatusCode::BAD_GATEWAY,
                "BAD_GATEWAY",
                "The backend response could not be read",
                &path,
            );
        }
    };

    let includes = include_names(parts.uri.query());
    let post_process = ctx.principal.is_some()
        && status.is_success()
        && is_json(&headers)
        && (!includes.is_empty() || !state.policies.is_empty());

    let bytes = if post_process {
        match serde_json::from_slice::<Document>(&bytes) {
            Ok(mut document) if !document.has_errors() => {
                if !includes.is_empty() {
                    let resolved = state
                        .includes
                        .resolve_includes(&includes, &clone_primary(&document))
                        .await;
                    splice_included(&mut document, resolved);
                }
                if let Some(principal) = &ctx.principal {
                    apply_field_policies(
                        &mut document,
                        principal,
                        &state.policies,
                        &state.registry,
                    );
                }
                match serde_json::to_vec(&document) {
                    Ok(rewritten) => rewritten.into(),
                    Err(e) => {
                        warn!(%path, error = %e, "Failed to re-serialize response document");
                        bytes
                    }
                }
            }
            // error documents and non-resource bodies pass through untouched
            _ => bytes,
        }
    } else {
        bytes
    };

    let mut response = Response::builder().status(status);
    if let Some(response_headers) = response.headers_mut() {
        *response_headers = headers;
    }
    match response.body(Body::from(bytes)) {
        Ok(response) => response,
        Err(e) => {
            warn!(%path, error = %e, "Failed to build response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Remove attributes whose field policy the caller does not satisfy, across
/// primary and included resources. Collections without field policies are
/// left untouched.
pub fn apply_field_policies(
    document: &mut Document,
    principal: &GatewayPrincipal,
    policies: &PolicyStore,
    registry: &RouteRegistry,
) {
    let filter = |resource: &mut crate::jsonapi::ResourceObject| {
        let Some(route) = registry.find_by_collection_name(&resource.resource_type) else {
            return;
        };
        let Some(config) = policies.get(&route.id) else {
            return;
        };
        for policy in config.field_policies() {
            if !evaluate(Some(policy), Some(principal)) {
                resource.attributes.remove(&policy.field_name);
            }
        }
    };

    for resource in document.primary_resources_mut() {
        filter(resource);
    }
    if let Some(included) = document.included.as_mut() {
        for resource in included {
            filter(resource);
        }
    }
}

fn clone_primary(document: &Document) -> Vec<crate::jsonapi::ResourceObject> {
    document
        .primary_resources()
        .into_iter()
        .cloned()
        .collect()
}

fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for (name, value) in headers {
        if !HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            forwarded.append(name.clone(), value.clone());
        }
    }
    forwarded
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("json"))
        .unwrap_or(false)
}

/// Comma-separated relationship names from the `include` query parameter.
/// The raw query arrives percent-encoded; values are decoded before splitting.
fn include_names(query: Option<&str>) -> Vec<String> {
    let Some(query) = query else {
        return Vec::new();
    };
    let mut names = Vec::new();
    for (key, value) in query.split('&').filter_map(|pair| pair.split_once('=')) {
        if key != "include" {
            continue;
        }
        let value = urlencoding::decode(value)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| value.to_string());
        names.extend(
            value
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(String::from),
        );
    }
    names
}

fn error_document(status: StatusCode, code: &str, detail: &str, path: &str) -> Response {
    let body = json!({
        "errors": [{
            "status": status.as_u16().to_string(),
            "code": code,
            "detail": detail,
            "meta": { "path": path },
        }]
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonapi::{PrimaryData, ResourceObject};
    use crate::policy::{AuthzConfig, FieldPolicy};
    use crate::routes::RouteDefinition;

    #[test]
    fn test_include_names() {
        assert_eq!(
            include_names(Some("include=author,comments&page=2")),
            vec!["author".to_string(), "comments".to_string()]
        );
        assert!(include_names(Some("page=2")).is_empty());
        assert!(include_names(None).is_empty());
    }

    #[test]
    fn test_include_names_decodes_percent_encoding() {
        assert_eq!(
            include_names(Some("include=author%2Ccomments")),
            vec!["author".to_string(), "comments".to_string()]
        );
    }

    #[test]
    fn test_forwardable_headers_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "gateway".parse().unwrap());
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("x-waypoint-subject", "bob".parse().unwrap());
        headers.insert("accept", "application/json".parse().unwrap());

        let forwarded = forwardable_headers(&headers);
        assert!(forwarded.get("host").is_none());
        assert!(forwarded.get("connection").is_none());
        assert_eq!(forwarded.len(), 2);
    }

    #[test]
    fn test_field_policies_strip_unauthorized_attributes() {
        let registry = RouteRegistry::new();
        registry.upsert(RouteDefinition::new(
            "coll-1",
            "/api/employees/**",
            "http://worker",
            "employees",
        ));
        let policies = PolicyStore::new();
        policies.update(
            AuthzConfig::new(
                "coll-1",
                vec![],
                vec![FieldPolicy::new("salary", "p1", ["hr".to_string()])],
            )
            .unwrap(),
        );

        let mut resource = ResourceObject::new("employees", "e1");
        resource.attributes.insert("name".into(), json!("Ada"));
        resource.attributes.insert("salary".into(), json!(120000));
        let mut document = Document {
            data: Some(PrimaryData::One(resource)),
            ..Default::default()
        };

        let outsider = GatewayPrincipal::new("bob@example.com", vec!["USER".to_string()]);
        apply_field_policies(&mut document, &outsider, &policies, &registry);
        let resource = &document.primary_resources()[0];
        assert!(resource.attributes.contains_key("name"));
        assert!(!resource.attributes.contains_key("salary"));
    }

    #[test]
    fn test_field_policies_keep_authorized_attributes() {
        let registry = RouteRegistry::new();
        registry.upsert(RouteDefinition::new(
            "coll-1",
            "/api/employees/**",
            "http://worker",
            "employees",
        ));
        let policies = PolicyStore::new();
        policies.update(
            AuthzConfig::new(
                "coll-1",
                vec![],
                vec![FieldPolicy::new("salary", "p1", ["hr".to_string()])],
            )
            .unwrap(),
        );

        let mut resource = ResourceObject::new("employees", "e1");
        resource.attributes.insert("salary".into(), json!(120000));
        let mut document = Document {
            data: Some(PrimaryData::One(resource)),
            ..Default::default()
        };

        let hr = GatewayPrincipal::new("eve@example.com", vec!["hr".to_string()]);
        apply_field_policies(&mut document, &hr, &policies, &registry);
        assert!(document.primary_resources()[0]
            .attributes
            .contains_key("salary"));
    }

    #[tokio::test]
    async fn test_error_document_shape() {
        let response = error_document(
            StatusCode::NOT_FOUND,
            "ROUTE_NOT_FOUND",
            "No backend is registered for this path",
            "/api/ghosts",
        );
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["errors"][0]["code"], "ROUTE_NOT_FOUND");
        assert_eq!(json["errors"][0]["status"], "404");
    }
}
