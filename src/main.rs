use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod aggregation;
mod background;
mod coordinator;
mod db;
mod db_models;
mod device;
mod error;
mod events;
mod geo;
mod handlers;
mod ingestion;
mod live;
mod manager;
mod metrics;
mod models;
mod queue;
mod seen_events;
mod source;
mod store;
mod utils;

use coordinator::AutoCoordinator;
use device::DeviceBridge;
use events::EventBus;
use live::LiveFeed;
use manager::{SessionManager, TrackingSettings};
use metrics::SampleCounters;
use source::{Notification, SamplingPolicy};
use store::{MemoryStore, TrackingStore};

const LIVE_FEED_CAPACITY: usize = 64;
const EVENT_BUS_CAPACITY: usize = 64;

/// Shared by all workers; everything inside is internally synchronized.
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub device: Arc<DeviceBridge>,
    pub events: EventBus,
    pub live: LiveFeed,
    pub counters: Arc<SampleCounters>,
    pub open_streams: Arc<AtomicU64>,
    pub started: Instant,
    pub keep_alive: Duration,
}

/// Command line configuration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Config {
    /// IP address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    address: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Path to the SQLite database file
    #[arg(long, default_value = "convoytracker.db")]
    database_file: PathBuf,

    /// Keep sessions and points in memory only; nothing survives a restart
    #[arg(long)]
    in_memory: bool,

    /// Minimum time between two samples, clamped into 2s..5s
    #[arg(long, default_value = "2s")]
    sample_interval: humantime::Duration,

    /// Minimum distance in metres between two samples, clamped into 5..10
    #[arg(long, default_value_t = 10.0)]
    sample_distance: f64,

    /// Whether the platform can run location delivery in the background
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    mobile: bool,

    /// Title of the persistent notification shown during background tracking
    #[arg(long, default_value = "Mission tracking")]
    notification_title: String,

    /// Body of the persistent notification shown during background tracking
    #[arg(long, default_value = "Your position is shared with dispatch during this mission")]
    notification_body: String,

    /// Points less accurate than this many metres are not pushed to live viewers
    #[arg(long, default_value_t = 50.0)]
    live_max_accuracy: f64,

    /// Points faster than this many km/h are not pushed to live viewers
    #[arg(long, default_value_t = 200.0)]
    live_max_speed: f64,

    /// Keep alive interval of live streams
    #[arg(long, default_value = "5s")]
    keep_alive: humantime::Duration,
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn TrackingStore>> {
    if config.in_memory {
        info!("Using in-memory store");
        Ok(Arc::new(MemoryStore::new()))
    } else {
        info!("Using database {:?}", config.database_file);
        Ok(Arc::new(db::DbClient::new(&config.database_file).await?))
    }
}

async fn real_main() -> anyhow::Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_line_number(true)
        .with_target(true)
        .init();

    info!("Initializing");

    let config = Config::parse();

    info!("Configuration: {config:?}");

    let store = open_store(&config).await?;
    let device = Arc::new(DeviceBridge::new(config.mobile));
    let live = LiveFeed::new(
        LIVE_FEED_CAPACITY,
        config.live_max_accuracy,
        config.live_max_speed,
    );
    let counters = Arc::new(SampleCounters::default());
    let settings = TrackingSettings {
        sampling: SamplingPolicy::new(config.sample_interval.into(), config.sample_distance),
        notification: Notification {
            title: config.notification_title.clone(),
            body: config.notification_body.clone(),
        },
    };
    let manager = Arc::new(SessionManager::new(
        store,
        device.clone(),
        live.clone(),
        counters.clone(),
        settings,
    ));

    let events = EventBus::new(EVENT_BUS_CAPACITY);
    let coordinator = AutoCoordinator::start(manager.clone(), &events).await?;

    let app_state = web::Data::new(AppState {
        manager,
        device,
        events,
        live,
        counters,
        open_streams: Arc::new(AtomicU64::new(0)),
        started: Instant::now(),
        keep_alive: config.keep_alive.into(),
    });

    info!("Starting server on {}:{}", config.address, config.port);

    let result = HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(TracingLogger::default())
            .wrap(cors)
            .app_data(app_state.clone())
            .service(handlers::set_permissions)
            .service(handlers::device_status)
            .service(handlers::post_sample)
            .service(handlers::post_background_batch)
            .service(handlers::start_session)
            .service(handlers::pause_session)
            .service(handlers::resume_session)
            .service(handlers::complete_session)
            .service(handlers::cancel_session)
            .service(handlers::get_points)
            .service(handlers::recompute_stats)
            .service(handlers::get_session)
            .service(handlers::get_active_session)
            .service(handlers::publish_event)
            .service(handlers::stream)
            .service(handlers::public_view)
            .service(handlers::get_metrics)
    })
    .bind((config.address.as_str(), config.port))?
    .run()
    .await;

    coordinator.shutdown().await;
    Ok(result?)
}

#[actix_web::main]
async fn main() -> std::process::ExitCode {
    match real_main().await {
        Ok(()) => std::process::ExitCode::from(0),
        Err(err) => {
            error!("{err:#}");
            std::process::ExitCode::from(10)
        }
    }
}
