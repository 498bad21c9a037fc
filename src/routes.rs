use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{info, warn};

/// Mapping from a collection to a request path pattern and backend address.
/// Consumers always receive clones; the registry exclusively owns the stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDefinition {
    /// Stable collection identifier, the registry key
    pub id: String,
    /// Literal path, `/*` single-segment or `/**` multi-segment suffix pattern
    pub path_pattern: String,
    pub backend_base_url: String,
    pub collection_name: String,
}

impl RouteDefinition {
    pub fn new(
        id: impl Into<String>,
        path_pattern: impl Into<String>,
        backend_base_url: impl Into<String>,
        collection_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            path_pattern: path_pattern.into(),
            backend_base_url: backend_base_url.into(),
            collection_name: collection_name.into(),
        }
    }
}

/// In-memory table of routable collections. Reads never block on writes;
/// two racing upserts for the same id resolve last-write-wins.
///
/// Updated continuously by the event ingestor and read on every request,
/// so all lookups work on clones of the stored definitions.
pub struct RouteRegistry {
    by_id: DashMap<String, RouteDefinition>,
    changed_tx: watch::Sender<u64>,
}

impl Default for RouteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteRegistry {
    pub fn new() -> Self {
        let (changed_tx, _) = watch::channel(0);
        Self {
            by_id: DashMap::new(),
            changed_tx,
        }
    }

    /// Insert or replace the route for its collection id. Idempotent.
    pub fn upsert(&self, route: RouteDefinition) {
        if route.id.is_empty() || route.path_pattern.is_empty() {
            warn!(id = %route.id, pattern = %route.path_pattern, "Refusing route with empty id or pattern");
            return;
        }
        let previous = self.by_id.insert(route.id.clone(), route.clone());
        match previous {
            Some(_) => info!(id = %route.id, pattern = %route.path_pattern, "Updated route"),
            None => info!(id = %route.id, pattern = %route.path_pattern, "Added route"),
        }
        self.notify_changed();
    }

    /// Remove the route for a collection id. Idempotent; unknown ids are a no-op.
    pub fn remove(&self, id: &str) {
        if id.is_empty() {
            return;
        }
        if self.by_id.remove(id).is_some() {
            info!(id, "Removed route");
            self.notify_changed();
        }
    }

    /// Resolve a request path to the most specific matching route.
    /// Exact pattern matches win over wildcard matches; among wildcard
    /// matches the longest literal prefix wins.
    pub fn find_by_path(&self, path: &str) -> Option<RouteDefinition> {
        if path.is_empty() {
            return None;
        }
        let mut best: Option<(usize, RouteDefinition)> = None;
        for entry in self.by_id.iter() {
            let route = entry.value();
            match pattern_specificity(path, &route.path_pattern) {
                Some(score) => {
                    if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                        best = Some((score, route.clone()));
                    }
                }
                None => continue,
            }
        }
        best.map(|(_, r)| r)
    }

    /// Look up the route owning a collection by name (the include resolver's index).
    pub fn find_by_id(&self, id: &str) -> Option<RouteDefinition> {
        self.by_id.get(id).map(|e| e.value().clone())
    }

    pub fn find_by_collection_name(&self, name: &str) -> Option<RouteDefinition> {
        self.by_id
            .iter()
            .find(|e| e.value().collection_name == name)
            .map(|e| e.value().clone())
    }

    pub fn all_routes(&self) -> Vec<RouteDefinition> {
        self.by_id.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Observe route-table generations; any route-pattern caches elsewhere
    /// invalidate themselves when the value changes.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changed_tx.subscribe()
    }

    fn notify_changed(&self) {
        self.changed_tx.send_modify(|gen| *gen = gen.wrapping_add(1));
    }
}

/// Match a request path against a route pattern, returning a specificity
/// score (higher is more specific) or None when it does not match.
///
/// Exact matches always outrank wildcard matches; wildcard matches are
/// ranked by literal prefix length, `/*` above `/**` at equal prefix.
fn pattern_specificity(path: &str, pattern: &str) -> Option<usize> {
    if path == pattern {
        return Some(usize::MAX);
    }
    if let Some(prefix) = pattern.strip_suffix("/**") {
        if let Some(remainder) = path.strip_prefix(prefix) {
            // The prefix must end on a segment boundary
            if remainder.is_empty() || remainder.starts_with('/') {
                return Some(prefix.len() * 2);
            }
        }
        return None;
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        if let Some(remainder) = path.strip_prefix(prefix) {
            // Exactly one more segment: "/x" with no further slash
            if remainder.len() > 1 && remainder.starts_with('/') && !remainder[1..].contains('/') {
                return Some(prefix.len() * 2 + 1);
            }
        }
        return None;
    }
    None
}
