use anyhow::Result;
use moka::future::Cache;
use sportsbook_engine::api::{self, ApiState};
use sportsbook_engine::broker::InMemoryBroker;
use sportsbook_engine::config::Config;
use sportsbook_engine::consumers::{spawn_consumers, EventDirectory};
use sportsbook_engine::event_log::{EventLog, InMemoryEventLog, PostgresEventLog};
use sportsbook_engine::runtime::{LoggingFilter, MetricsFilter, Runtime};
use sportsbook_engine::store::{InMemoryStateStore, PostgresStateStore, StateStore};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sportsbook_engine=debug,info")),
        )
        .init();

    let config = Config::from_env();

    let (store, event_log): (Arc<dyn StateStore>, Arc<dyn EventLog>) =
        match std::env::var("DATABASE_URL") {
            Ok(url) => {
                info!("connecting to postgres state store");
                let pool = PgPoolOptions::new().max_connections(10).connect(&url).await?;
                (
                    Arc::new(PostgresStateStore::new(pool.clone())),
                    Arc::new(PostgresEventLog::new(pool)),
                )
            }
            Err(_) => {
                info!("DATABASE_URL not set; running with in-memory stores");
                (Arc::new(InMemoryStateStore::new()), Arc::new(InMemoryEventLog::new()))
            }
        };

    let broker = Arc::new(InMemoryBroker::default());
    let metrics = Arc::new(MetricsFilter::new());
    let runtime = Runtime::builder(config)
        .store(store)
        .event_log(event_log)
        .publisher(broker.clone())
        .filter(metrics.clone())
        .filter(Arc::new(LoggingFilter))
        .build();

    let directory = EventDirectory::new();
    spawn_consumers(runtime.clone(), broker.clone(), directory.clone());

    // short-lived read cache for the listing endpoints; mutations invalidate
    let cache = Cache::builder()
        .max_capacity(1_000)
        .time_to_live(Duration::from_secs(10))
        .build();

    let state = ApiState { runtime, broker, directory, cache, metrics };
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    let app = api::router(state).layer(ServiceBuilder::new().layer(cors));

    let port: u16 =
        std::env::var("PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(3000);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "sportsbook engine listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
