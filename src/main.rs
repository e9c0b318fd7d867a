//! Session replay relay server
//!
//! Wires the components together and owns the teardown order:
//! HTTP server, then hub, then batcher (drain and flush), then pool.

use std::io;
use std::sync::{Arc, Weak};
use std::time::Instant;

use actix_web::{middleware, web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use replay_relay::api::{self, AppState};
use replay_relay::config::{Config, DEFAULT_RETENTION_HOURS, SESSION_IDLE_EVICTION};
use replay_relay::hub::ConnectionHub;
use replay_relay::registry::{SessionEventSink, SessionRegistry};
use replay_relay::store::{HistoryReader, ReplayStore, SessionStore};
use replay_relay::EventBatcher;

#[actix_web::main]
async fn main() -> io::Result<()> {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.clone()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting session replay relay");

    let store = SessionStore::connect(&config.database)
        .await
        .map_err(into_io_error)?;
    store.init_schema().await.map_err(into_io_error)?;
    let store = Arc::new(store);

    let batcher = EventBatcher::new(store.clone(), config.relay.batch_size);
    batcher.spawn_worker(config.relay.batch_interval);

    let registry = Arc::new(SessionRegistry::new(
        batcher.clone(),
        config.relay.max_events_per_session,
    ));

    let history: Arc<dyn HistoryReader> = store.clone();
    let hub = Arc::new(ConnectionHub::new(
        registry.clone(),
        history,
        config.server.client_timeout,
    ));
    let hub_sink: Arc<dyn SessionEventSink> = hub.clone();
    let sink: Weak<dyn SessionEventSink> = Arc::downgrade(&hub_sink);
    registry.subscribe(sink);

    let heartbeat = hub.spawn_heartbeat_task(config.server.heartbeat_interval);
    let maintenance = spawn_maintenance_task(
        registry.clone(),
        store.clone(),
        config.relay.session_cleanup_interval,
    );

    let directory: Arc<dyn ReplayStore> = store.clone();
    let state = web::Data::new(AppState {
        hub: hub.clone(),
        registry,
        store: directory,
        batcher: batcher.clone(),
        started_at: Instant::now(),
    });

    let bind_address = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!(address = %bind_address, "http server listening");

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(middleware::Logger::default())
            .configure(api::configure)
    })
    .workers(num_cpus::get())
    .bind(&bind_address)?
    .run()
    .await?;

    tracing::info!("shutting down");
    heartbeat.abort();
    maintenance.abort();
    hub.shutdown();
    batcher.shutdown().await;
    store.close().await;

    Ok(())
}

/// Periodic eviction of idle in-memory sessions plus store-side cleanup of
/// aged rows. The two retention windows are configured independently.
fn spawn_maintenance_task(
    registry: Arc<SessionRegistry>,
    store: Arc<SessionStore>,
    interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;

            let evicted = registry.evict_idle(SESSION_IDLE_EVICTION);
            if evicted > 0 {
                tracing::info!(evicted, "evicted idle sessions");
            }

            if let Err(e) = store.cleanup_old_sessions(DEFAULT_RETENTION_HOURS).await {
                tracing::warn!(error = %e, "store cleanup failed");
            }
        }
    })
}

fn into_io_error(e: replay_relay::StoreError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}
