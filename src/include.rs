use crate::cache::CacheStore;
use crate::jsonapi::{Document, ResourceIdentifier, ResourceObject};
use crate::routes::RouteRegistry;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Expands named relationships into full related-resource bodies on the
/// response path. Resolution is cache-aside against `resource:{type}:{id}`
/// with a backend fetch fallback; one identifier's failure never cancels
/// the rest of the batch.
pub struct IncludeResolver {
    cache: Arc<dyn CacheStore>,
    registry: Arc<RouteRegistry>,
    client: reqwest::Client,
    key_prefix: String,
    ttl: Duration,
    concurrency: usize,
}

impl IncludeResolver {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        registry: Arc<RouteRegistry>,
        client: reqwest::Client,
        key_prefix: impl Into<String>,
        ttl: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            cache,
            registry,
            client,
            key_prefix: key_prefix.into(),
            ttl,
            concurrency: concurrency.max(1),
        }
    }

    pub fn cache_key(&self, resource_type: &str, id: &str) -> String {
        format!("{}{}:{}", self.key_prefix, resource_type, id)
    }

    /// Resolve the requested include names against the primary resources.
    /// Returns the successfully resolved resources; order is not guaranteed.
    pub async fn resolve_includes(
        &self,
        names: &[String],
        primary: &[ResourceObject],
    ) -> Vec<ResourceObject> {
        if names.is_empty() || primary.is_empty() {
            return Vec::new();
        }

        let identifiers = collect_identifiers(names, primary);
        if identifiers.is_empty() {
            return Vec::new();
        }

        stream::iter(identifiers)
            .map(|identifier| async move { self.resolve_one(&identifier).await })
            .buffer_unordered(self.concurrency)
            .filter_map(|resolved| async move { resolved })
            .collect()
            .await
    }

    async fn resolve_one(&self, identifier: &ResourceIdentifier) -> Option<ResourceObject> {
        let key = self.cache_key(&identifier.resource_type, &identifier.id);

        match self.cache.get(&key).await {
            Ok(Some(json)) => match serde_json::from_str::<ResourceObject>(&json) {
                Ok(resource) => {
                    debug!(%key, "Resource cache hit");
                    return Some(resource);
                }
                Err(e) => {
                    warn!(%key, error = %e, "Cached resource undecodable, refetching");
                }
            },
            Ok(None) => debug!(%key, "Resource cache miss"),
            Err(e) => warn!(%key, error = %e, "Resource cache lookup failed"),
        }

        self.fetch_and_cache(identifier).await
    }

    /// Fetch the resource from the backend owning its type; on success cache it.
    /// Any failure drops this one identifier silently.
    async fn fetch_and_cache(&self, identifier: &ResourceIdentifier) -> Option<ResourceObject> {
        let route = match self.registry.find_by_collection_name(&identifier.resource_type) {
            Some(route) => route,
            None => {
                warn!(
                    resource_type = %identifier.resource_type,
                    "No route for collection, dropping include"
                );
                return None;
            }
        };

        let url = format!(
            "{}/api/collections/{}/{}",
            route.backend_base_url.trim_end_matches('/'),
            identifier.resource_type,
            identifier.id
        );

        let body = match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    warn!(%url, error = %e, "Failed to read backend response");
                    return None;
                }
            },
            Ok(response) => {
                warn!(%url, status = %response.status(), "Backend returned error for include");
                return None;
            }
            Err(e) => {
                warn!(%url, error = %e, "Backend request failed for include");
                return None;
            }
        };

        let document: Document = match serde_json::from_str(&body) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(%url, error = %e, "Backend response is not a resource document");
                return None;
            }
        };

        let resource = document.primary_resources().first().cloned().cloned()?;

        let key = self.cache_key(&resource.resource_type, &resource.id);
        match serde_json::to_string(&resource) {
            Ok(json) => {
                if let Err(e) = self.cache.put(&key, &json, self.ttl).await {
                    warn!(%key, error = %e, "Failed to cache fetched resource");
                }
            }
            Err(e) => warn!(%key, error = %e, "Failed to serialize resource for caching"),
        }

        Some(resource)
    }
}

/// Collect the de-duplicated identifiers referenced by the requested include
/// names. Each name matches a resource's relationships in three ordered
/// stages, the first that yields a match winning:
/// exact key, case-insensitive key, then target resource type.
fn collect_identifiers(
    names: &[String],
    primary: &[ResourceObject],
) -> HashSet<ResourceIdentifier> {
    let mut identifiers = HashSet::new();

    for resource in primary {
        if resource.relationships.is_empty() {
            continue;
        }

        for name in names {
            // 1. Exact key match
            if let Some(rel) = resource.relationships.get(name) {
                identifiers.extend(rel.identifiers().into_iter().cloned());
                continue;
            }

            // 2. Case-insensitive key match
            if let Some(rel) = resource
                .relationships
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, rel)| rel)
            {
                identifiers.extend(rel.identifiers().into_iter().cloned());
                continue;
            }

            // 3. Match by the relationship's declared target type, so
            //    ?include=categories resolves a relationship keyed category_id
            for rel in resource.relationships.values() {
                if rel
                    .target_type()
                    .map(|t| t.eq_ignore_ascii_case(name))
                    .unwrap_or(false)
                {
                    identifiers.extend(rel.identifiers().into_iter().cloned());
                }
            }
        }
    }

    identifiers
}

/// Splice resolved resources into a document's `included` section,
/// ahead of whatever the backend already included.
pub fn splice_included(document: &mut Document, mut resolved: Vec<ResourceObject>) {
    if resolved.is_empty() {
        return;
    }
    if let Some(existing) = document.included.take() {
        resolved.extend(existing);
    }
    document.included = Some(resolved);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::jsonapi::Relationship;

    fn resource_with_rel(key: &str, target: ResourceIdentifier) -> ResourceObject {
        let mut resource = ResourceObject::new("orders", "1");
        resource
            .relationships
            .insert(key.to_string(), Relationship::one(target));
        resource
    }

    fn resolver(cache: Arc<dyn CacheStore>, registry: Arc<RouteRegistry>) -> IncludeResolver {
        IncludeResolver::new(
            cache,
            registry,
            reqwest::Client::new(),
            "resource:",
            Duration::from_secs(600),
            4,
        )
    }

    async fn seed(cache: &MemoryCache, resource: &ResourceObject) {
        let key = format!("resource:{}:{}", resource.resource_type, resource.id);
        cache
            .put(
                &key,
                &serde_json::to_string(resource).unwrap(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
    }

    #[test]
    fn test_exact_key_match() {
        let primary = vec![resource_with_rel(
            "author",
            ResourceIdentifier::new("people", "p1"),
        )];
        let ids = collect_identifiers(&["author".to_string()], &primary);
        assert_eq!(ids.len(), 1);
        assert!(ids.contains(&ResourceIdentifier::new("people", "p1")));
    }

    #[test]
    fn test_case_insensitive_key_match() {
        let primary = vec![resource_with_rel(
            "Author",
            ResourceIdentifier::new("people", "p1"),
        )];
        let ids = collect_identifiers(&["author".to_string()], &primary);
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn test_target_type_match() {
        // Relationship keyed category_id whose target type is "categories"
        let primary = vec![resource_with_rel(
            "category_id",
            ResourceIdentifier::new("categories", "c9"),
        )];
        let ids = collect_identifiers(&["categories".to_string()], &primary);
        assert_eq!(ids.len(), 1);
        assert!(ids.contains(&ResourceIdentifier::new("categories", "c9")));
    }

    #[test]
    fn test_unmatched_name_yields_nothing() {
        let primary = vec![resource_with_rel(
            "author",
            ResourceIdentifier::new("people", "p1"),
        )];
        let ids = collect_identifiers(&["comments".to_string()], &primary);
        assert!(ids.is_empty());
    }

    #[test]
    fn test_identifiers_deduplicated_across_resources() {
        let shared = ResourceIdentifier::new("people", "p1");
        let primary = vec![
            resource_with_rel("author", shared.clone()),
            resource_with_rel("author", shared),
        ];
        let ids = collect_identifiers(&["author".to_string()], &primary);
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_from_cache() {
        let cache = Arc::new(MemoryCache::new());
        let mut person = ResourceObject::new("people", "p1");
        person
            .attributes
            .insert("name".into(), serde_json::json!("Ada"));
        seed(&cache, &person).await;

        let resolver = resolver(cache, Arc::new(RouteRegistry::new()));
        let primary = vec![resource_with_rel(
            "author",
            ResourceIdentifier::new("people", "p1"),
        )];

        let resolved = resolver
            .resolve_includes(&["author".to_string()], &primary)
            .await;
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].attributes["name"], serde_json::json!("Ada"));
    }

    #[tokio::test]
    async fn test_one_failure_does_not_drop_the_batch() {
        let cache = Arc::new(MemoryCache::new());
        let person = ResourceObject::new("people", "p1");
        seed(&cache, &person).await;
        // second identifier: not cached and no route registered -> dropped

        let resolver = resolver(cache, Arc::new(RouteRegistry::new()));
        let mut resource = ResourceObject::new("orders", "1");
        resource
            .relationships
            .insert("author".into(), Relationship::one(ResourceIdentifier::new("people", "p1")));
        resource.relationships.insert(
            "category".into(),
            Relationship::one(ResourceIdentifier::new("categories", "c1")),
        );

        let resolved = resolver
            .resolve_includes(
                &["author".to_string(), "category".to_string()],
                &[resource],
            )
            .await;
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, "p1");
    }

    #[tokio::test]
    async fn test_no_names_or_primary_is_empty() {
        let resolver = resolver(Arc::new(MemoryCache::new()), Arc::new(RouteRegistry::new()));
        assert!(resolver.resolve_includes(&[], &[]).await.is_empty());
        assert!(resolver
            .resolve_includes(&["author".to_string()], &[])
            .await
            .is_empty());
    }

    #[test]
    fn test_splice_included_prepends_resolved() {
        let mut doc = Document {
            included: Some(vec![ResourceObject::new("tags", "t1")]),
            ..Default::default()
        };
        splice_included(&mut doc, vec![ResourceObject::new("people", "p1")]);

        let included = doc.included.expect("included");
        assert_eq!(included.len(), 2);
        assert_eq!(included[0].resource_type, "people");
        assert_eq!(included[1].resource_type, "tags");
    }

    #[test]
    fn test_splice_included_empty_is_noop() {
        let mut doc = Document::default();
        splice_included(&mut doc, Vec::new());
        assert!(doc.included.is_none());
    }
}
