use clap::Parser;
use miette::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, EnvFilter};
use waypoint::bootstrap::BootstrapService;
use waypoint::cache::{CacheStore, MemoryCache, RedisCache};
use waypoint::events::EventIngestor;
use waypoint::include::IncludeResolver;
use waypoint::permissions::{HttpPermissionAuthority, PermissionResolver};
use waypoint::pipeline::{Pipeline, PermissionResolutionStage, RouteAuthorizationStage};
use waypoint::policy::PolicyStore;
use waypoint::routes::RouteRegistry;
use waypoint::settings::Settings;
use waypoint::web::{self, AppState};

#[derive(Parser, Debug)]
#[command(name = "waypoint", version, about = "Edge API gateway decision engine")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = Arc::new(Settings::load(&cli.config)?);
    tracing::info!(?settings, "Loaded configuration");

    // cache store; a dead redis degrades to an in-process cache so the
    // gateway still starts (fail-open, like everything downstream of it)
    let cache: Arc<dyn CacheStore> =
        match RedisCache::connect(&settings.redis.url, settings.redis.op_timeout()).await {
            Ok(redis) => Arc::new(redis),
            Err(e) => {
                tracing::warn!(error = %e, "Redis unavailable, using in-process cache");
                Arc::new(MemoryCache::new())
            }
        };

    let client = reqwest::Client::builder()
        .timeout(settings.http_timeout())
        .build()
        .map_err(|e| miette::miette!("failed to build http client: {e}"))?;

    let registry = Arc::new(RouteRegistry::new());
    let policies = Arc::new(PolicyStore::new());

    let resolver = Arc::new(PermissionResolver::new(
        cache.clone(),
        Arc::new(HttpPermissionAuthority::new(
            client.clone(),
            settings.authority.url.clone(),
        )),
        settings.cache.permissions_key_prefix.clone(),
        settings.permissions_ttl(),
    ));

    let includes = Arc::new(IncludeResolver::new(
        cache.clone(),
        registry.clone(),
        client.clone(),
        settings.cache.resource_key_prefix.clone(),
        settings.resource_ttl(),
        settings.cache.include_concurrency,
    ));

    let pipeline = Arc::new(Pipeline::new(vec![
        Box::new(PermissionResolutionStage::new(
            settings.clone(),
            resolver.clone(),
        )),
        Box::new(RouteAuthorizationStage::new(
            settings.clone(),
            registry.clone(),
        )),
    ]));

    // initial route and policy provisioning
    let bootstrap = Arc::new(BootstrapService::new(
        settings.clone(),
        client.clone(),
        registry.clone(),
        policies.clone(),
    ));
    bootstrap.initialize().await;

    // configuration refresh requests coming from the event stream
    let (refresh_tx, mut refresh_rx) = mpsc::channel(1);
    {
        let bootstrap = bootstrap.clone();
        tokio::spawn(async move {
            while refresh_rx.recv().await.is_some() {
                if let Err(e) = bootstrap.refresh_routes().await {
                    tracing::warn!(error = %e, "Route refresh failed");
                }
            }
        });
    }

    // background configuration-event consumer
    if settings.events.enabled {
        let ingestor = Arc::new(EventIngestor::new(
            registry.clone(),
            policies.clone(),
            cache.clone(),
            resolver.clone(),
            settings.cache.resource_key_prefix.clone(),
            refresh_tx,
        ));
        tokio::spawn(ingestor.run(
            settings.redis.url.clone(),
            settings.events.channel.clone(),
        ));
    }

    web::serve(AppState {
        settings,
        registry,
        policies,
        pipeline,
        includes,
        client,
    })
    .await?;
    Ok(())
}
