use std::net::SocketAddr;
use std::sync::Arc;

use config_validator::IntegrityConfig;
use dlq::{DlqStore, InMemoryDlqStore, PgDlqStore};
use event_bus::{
    EventBus, InMemoryBus, InMemorySchemaRegistry, NatsBus, SchemaRegistry, ShutdownSignal,
};
use event_consumer::{spawn_consumer, ConsumerConfig, DedupStore, InMemoryDedupStore, PgDedupStore};
use idempotency::{Idempotency, IdempotencyStore, InMemoryIdempotencyStore, PgIdempotencyStore};
use outbox::{BusSink, Relay, RelayConfig};
use smoke_test::events::{CONSUMER_GROUP, THING_RENAMED_SUBJECT};
use smoke_test::{
    build_pipeline, router, AppState, Config, MemoryThingStore, PgThingStore, Sweeper, ThingStore,
};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

struct Stores {
    things: Arc<dyn ThingStore>,
    dedup: Arc<dyn DedupStore>,
    dlq: Arc<dyn DlqStore>,
    idempotency: Arc<dyn IdempotencyStore>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,smoke_test=debug".into()),
        )
        .init();

    tracing::info!("Starting smoke-test module...");

    let config = Config::from_env()?;
    let integrity = IntegrityConfig::load(config.config_path.as_deref())?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        bus_type = %config.bus_type,
        store_backend = %config.store_backend,
        "Configuration loaded"
    );

    let bus: Arc<dyn EventBus> = match config.bus_type.as_str() {
        "nats" => {
            tracing::info!("Connecting to NATS at {}", config.nats_url);
            Arc::new(NatsBus::connect(&config.nats_url).await?)
        }
        _ => {
            tracing::info!("Using InMemory event bus");
            Arc::new(InMemoryBus::new())
        }
    };

    let registry: Arc<dyn SchemaRegistry> = match &config.schema_dir {
        Some(dir) => Arc::new(InMemorySchemaRegistry::load_from_dir(dir)?),
        None => Arc::new(InMemorySchemaRegistry::new()),
    };

    let idempotency_ttl = chrono::Duration::from_std(integrity.idempotency_ttl())?;
    let database_url = config
        .database_url
        .as_deref()
        .filter(|_| config.store_backend == "postgres");
    let stores = match database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;

            tracing::info!("Running migrations...");
            let mut shared = sqlx::migrate!("../../db/migrations");
            shared.set_ignore_missing(true);
            shared.run(&pool).await?;
            let mut local = sqlx::migrate!("./db/migrations");
            local.set_ignore_missing(true);
            local.run(&pool).await?;

            Stores {
                things: Arc::new(PgThingStore::new(pool.clone())),
                dedup: Arc::new(PgDedupStore::new(pool.clone())),
                dlq: Arc::new(PgDlqStore::new(pool.clone())),
                idempotency: Arc::new(PgIdempotencyStore::new(pool).with_ttl(idempotency_ttl)),
            }
        }
        None => {
            tracing::warn!("Using in-memory stores; state is lost on restart");
            Stores {
                things: Arc::new(MemoryThingStore::new()),
                dedup: Arc::new(InMemoryDedupStore::new()),
                dlq: Arc::new(InMemoryDlqStore::new()),
                idempotency: Arc::new(InMemoryIdempotencyStore::new().with_ttl(idempotency_ttl)),
            }
        }
    };

    let pipeline = Arc::new(build_pipeline(
        stores.things.clone(),
        stores.dedup.clone(),
        &integrity,
        Some(registry),
    ));

    let shutdown = ShutdownSignal::with_grace_period(integrity.shutdown_grace());
    let os_signal = shutdown.clone();
    tokio::spawn(async move { os_signal.wait_for_os_signal().await });

    let sink = Arc::new(BusSink::new(bus.clone()));
    let relay = Relay::new(stores.things.outbox(), sink.clone(), sink, stores.dlq.clone())
        .with_config(RelayConfig {
            batch_size: integrity.outbox_flush_batch_size,
            poll_interval: integrity.worker_poll(),
            max_attempts: integrity.relay_max_attempts,
            durable_ops: false,
            shutdown_grace: integrity.shutdown_grace(),
        });
    let relay = Arc::new(relay).spawn(shutdown.clone());
    tracing::info!("Outbox relay started");

    let consumer = spawn_consumer(
        ConsumerConfig::new(THING_RENAMED_SUBJECT, CONSUMER_GROUP),
        bus.clone(),
        pipeline.clone(),
        stores.dlq.clone(),
        shutdown.clone(),
    );
    tracing::info!(subject = THING_RENAMED_SUBJECT, "Event consumer started");

    let sweeper = Sweeper::new(stores.dedup.clone(), stores.idempotency.clone())
        .with_outbox(stores.things.outbox(), integrity.outbox_retention())
        .spawn(shutdown.clone());

    let idempotency = Idempotency::new(stores.idempotency.clone())
        .with_in_flight(integrity.idempotency_in_flight());
    let app = router(
        AppState {
            store: stores.things.clone(),
            pipeline,
            dlq: stores.dlq.clone(),
        },
        idempotency,
    );

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("smoke-test listening on {}", addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;

    // Writers stop first; the relay drains what is already committed.
    stores.things.lifecycle().begin_drain();
    stores.idempotency.lifecycle().begin_drain();
    if !relay.shutdown().await {
        tracing::warn!("relay aborted before draining");
    }
    match consumer.await {
        Ok(Ok(stats)) => tracing::info!(processed = stats.processed, "consumer drained"),
        Ok(Err(e)) => tracing::error!(error = %e, "consumer failed"),
        Err(e) => tracing::error!(error = %e, "consumer task panicked"),
    }
    sweeper.abort();

    for lifecycle in [
        stores.things.lifecycle(),
        stores.dedup.lifecycle(),
        stores.dlq.lifecycle(),
        stores.idempotency.lifecycle(),
    ] {
        lifecycle.close();
    }
    tracing::info!("smoke-test stopped");
    Ok(())
}
