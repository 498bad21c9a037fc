use miette::{IntoDiagnostic, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub server: Server,
    pub redis: Redis,
    pub control_plane: ControlPlane,
    pub authority: Authority,
    pub security: Security,
    pub cache: Cache,
    pub events: Events,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Redis {
    /// Connection URL for the external cache store, e.g. redis://localhost:6379
    pub url: String,
    /// Per-operation timeout in milliseconds. Cache calls must never hang a request.
    pub op_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlane {
    /// Base URL of the control plane service
    pub url: String,
    /// Path of the bootstrap endpoint serving initial routes and authz config
    pub bootstrap_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authority {
    /// Base URL of the permission authority (worker service).
    /// Also the default backend for collections without an assigned worker.
    pub url: String,
    /// Outbound HTTP timeout in seconds, applied to all gateway-originated calls
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Security {
    /// When false the gateway runs in authentication-only mode:
    /// any authenticated principal may reach any path.
    #[serde(default)]
    pub permissions_enabled: bool,
    /// Role that short-circuits permission resolution with an all-permissive result
    pub platform_admin_role: String,
    /// Path prefixes that bypass authentication and authorization entirely
    pub public_paths: Vec<String>,
    /// Prefix of the collection API namespace; object-level checks apply only here
    pub api_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cache {
    pub permissions_ttl_minutes: u64,
    pub resource_ttl_minutes: u64,
    pub permissions_key_prefix: String,
    pub resource_key_prefix: String,
    /// Bounded fan-out when resolving include identifiers
    pub include_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Events {
    /// Enable the background configuration-event consumer
    pub enabled: bool,
    /// Pub/sub channel carrying configuration change events
    pub channel: String,
}

impl Redis {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for Redis {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            op_timeout_ms: 2000,
        }
    }
}

impl Default for ControlPlane {
    fn default() -> Self {
        Self {
            url: "http://localhost:8090".to_string(),
            bootstrap_path: "/control/bootstrap".to_string(),
        }
    }
}

impl Default for Authority {
    fn default() -> Self {
        Self {
            url: "http://localhost:8081".to_string(),
            timeout_secs: 5,
        }
    }
}

impl Default for Security {
    fn default() -> Self {
        Self {
            permissions_enabled: false,
            platform_admin_role: "PLATFORM_ADMIN".to_string(),
            public_paths: vec!["/health".to_string(), "/control/bootstrap".to_string()],
            api_prefix: "/api/".to_string(),
        }
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            permissions_ttl_minutes: 5,
            resource_ttl_minutes: 10,
            permissions_key_prefix: "permissions:".to_string(),
            resource_key_prefix: "resource:".to_string(),
            include_concurrency: 8,
        }
    }
}

impl Default for Events {
    fn default() -> Self {
        Self {
            enabled: true,
            channel: "waypoint.config".to_string(),
        }
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("server.host", Server::default().host)
            .into_diagnostic()?
            .set_default("server.port", Server::default().port)
            .into_diagnostic()?
            .set_default("redis.url", Redis::default().url)
            .into_diagnostic()?
            .set_default("redis.op_timeout_ms", Redis::default().op_timeout_ms)
            .into_diagnostic()?
            .set_default("control_plane.url", ControlPlane::default().url)
            .into_diagnostic()?
            .set_default(
                "control_plane.bootstrap_path",
                ControlPlane::default().bootstrap_path,
            )
            .into_diagnostic()?
            .set_default("authority.url", Authority::default().url)
            .into_diagnostic()?
            .set_default("authority.timeout_secs", Authority::default().timeout_secs)
            .into_diagnostic()?
            .set_default("security.permissions_enabled", false)
            .into_diagnostic()?
            .set_default(
                "security.platform_admin_role",
                Security::default().platform_admin_role,
            )
            .into_diagnostic()?
            .set_default("security.public_paths", Security::default().public_paths)
            .into_diagnostic()?
            .set_default("security.api_prefix", Security::default().api_prefix)
            .into_diagnostic()?
            .set_default(
                "cache.permissions_ttl_minutes",
                Cache::default().permissions_ttl_minutes,
            )
            .into_diagnostic()?
            .set_default(
                "cache.resource_ttl_minutes",
                Cache::default().resource_ttl_minutes,
            )
            .into_diagnostic()?
            .set_default(
                "cache.permissions_key_prefix",
                Cache::default().permissions_key_prefix,
            )
            .into_diagnostic()?
            .set_default(
                "cache.resource_key_prefix",
                Cache::default().resource_key_prefix,
            )
            .into_diagnostic()?
            .set_default(
                "cache.include_concurrency",
                Cache::default().include_concurrency as u64,
            )
            .into_diagnostic()?
            .set_default("events.enabled", Events::default().enabled)
            .into_diagnostic()?
            .set_default("events.channel", Events::default().channel)
            .into_diagnostic()?;

        // Optional file
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment overrides: WAYPOINT__SERVER__PORT=9090, etc.
        builder =
            builder.add_source(config::Environment::with_prefix("WAYPOINT").separator("__"));

        let cfg = builder.build().into_diagnostic()?;
        let s: Settings = cfg.try_deserialize().into_diagnostic()?;
        Ok(s)
    }

    pub fn permissions_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.permissions_ttl_minutes * 60)
    }

    pub fn resource_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.resource_ttl_minutes * 60)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.authority.timeout_secs)
    }

    pub fn is_public_path(&self, path: &str) -> bool {
        self.security
            .public_paths
            .iter()
            .any(|p| path == p || path.starts_with(&format!("{}/", p.trim_end_matches('/'))))
    }
}
