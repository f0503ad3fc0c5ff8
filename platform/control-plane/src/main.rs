use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use config_validator::{ConfigValidator, IntegrityConfig};
use control_plane::{router, DlqController};
use dlq::{DlqStore, InMemoryDlqStore, PgDlqStore};
use event_bus::{EventBus, InMemoryBus, NatsBus, ShutdownSignal};
use idempotency::{Idempotency, IdempotencyStore, InMemoryIdempotencyStore, PgIdempotencyStore};
use outbox::{BusSink, Outbox, PgOutbox};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

type Stores = (
    Arc<dyn DlqStore>,
    Arc<dyn IdempotencyStore>,
    Option<Arc<dyn Outbox>>,
);

struct Settings {
    host: String,
    port: u16,
    bus_type: String,
    nats_url: String,
    store_backend: String,
    database_url: Option<String>,
    config_path: Option<PathBuf>,
}

impl Settings {
    fn from_env() -> Result<Self, config_validator::ConfigError> {
        let mut v = ConfigValidator::from_env();
        let store_backend = v.one_of("STORE_BACKEND", &["memory", "postgres"], "postgres");
        let database_url = if store_backend == "postgres" {
            v.require("DATABASE_URL")
        } else {
            v.raw("DATABASE_URL")
        };
        let settings = Settings {
            host: v.optional_or("HOST", "0.0.0.0"),
            port: v.parse_or("PORT", 8091),
            bus_type: v.one_of("BUS_TYPE", &["inmemory", "nats"], "inmemory"),
            nats_url: v.optional_or("NATS_URL", "nats://localhost:4222"),
            store_backend,
            database_url,
            config_path: v.raw("CONFIG_PATH").map(PathBuf::from),
        };
        v.finish()?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,control_plane=debug".into()),
        )
        .init();

    tracing::info!("Starting control-plane...");

    let settings = Settings::from_env()?;
    let integrity = IntegrityConfig::load(settings.config_path.as_deref())?;
    tracing::info!(
        host = %settings.host,
        port = settings.port,
        bus_type = %settings.bus_type,
        store_backend = %settings.store_backend,
        "Configuration loaded"
    );

    let bus: Arc<dyn EventBus> = match settings.bus_type.as_str() {
        "nats" => {
            tracing::info!("Connecting to NATS at {}", settings.nats_url);
            Arc::new(NatsBus::connect(&settings.nats_url).await?)
        }
        _ => {
            tracing::info!("Using InMemory event bus");
            Arc::new(InMemoryBus::new())
        }
    };

    let in_flight = integrity.idempotency_in_flight();
    let ttl = chrono::Duration::from_std(integrity.idempotency_ttl())?;

    let database_url = settings
        .database_url
        .as_deref()
        .filter(|_| settings.store_backend == "postgres");
    let (dlq, idem_store, outbox): Stores = match database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;

            tracing::info!("Running migrations...");
            let mut migrator = sqlx::migrate!("../../db/migrations");
            migrator.set_ignore_missing(true);
            migrator.run(&pool).await?;

            (
                Arc::new(PgDlqStore::new(pool.clone())),
                Arc::new(PgIdempotencyStore::new(pool.clone()).with_ttl(ttl)),
                Some(Arc::new(PgOutbox::new(pool))),
            )
        }
        None => {
            tracing::warn!("Using in-memory stores; DLQ contents are lost on restart");
            (
                Arc::new(InMemoryDlqStore::new()),
                Arc::new(InMemoryIdempotencyStore::new().with_ttl(ttl)),
                None,
            )
        }
    };

    let mut controller = DlqController::new(dlq.clone(), Arc::new(BusSink::new(bus)));
    if let Some(outbox) = outbox {
        controller = controller.with_outbox(outbox);
    }

    let idempotency = Idempotency::new(idem_store.clone()).with_in_flight(in_flight);
    let app = router(Arc::new(controller), idempotency);

    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("control-plane listening on {}", addr);

    let shutdown = ShutdownSignal::with_grace_period(integrity.shutdown_grace());
    let os_signal = shutdown.clone();
    tokio::spawn(async move { os_signal.wait_for_os_signal().await });

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;

    dlq.lifecycle().begin_drain();
    idem_store.lifecycle().begin_drain();
    dlq.lifecycle().close();
    idem_store.lifecycle().close();
    tracing::info!("control-plane stopped");
    Ok(())
}
