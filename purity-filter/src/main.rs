//! purity-filter: metered image content-safety gateway
//!
//! Accepts batches of image URIs, answers with cached or freshly computed
//! safe-search scores, and bills usage against license keys.

use anyhow::{bail, Context, Result};
use clap::Parser;
use purity_common::config::{default_config_path, TomlConfig};
use purity_common::db::init_database;
use purity_filter::services::{
    BatchClassifier, NoopUsageMeter, SqliteAnnotationStore, SqliteLicenseLedger, StripeUsageMeter,
    UsageMeter, VisionClient,
};
use purity_filter::{build_router, AppState, FilterSettings};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "purity-filter")]
#[command(about = "Metered image content-safety filter", long_about = None)]
#[command(version)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "PURITY_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP port (overrides config file and PURITY_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// SQLite database path (overrides config file and PURITY_DB_PATH)
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = TomlConfig::load_or_default(config_path.as_deref())?;
    config.apply_env()?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(database) = args.database {
        config.database_path = Some(database);
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    // RUST_LOG wins over the configured level when set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!(
        "Starting Purity Filter (purity-filter) v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    // Config loading ran before the subscriber existed
    match config_path {
        Some(path) if path.exists() => info!("Configuration file: {}", path.display()),
        Some(path) => warn!("Config file {} not found, using defaults", path.display()),
        None => warn!("Could not determine config directory, using defaults"),
    }

    let db_path = config.resolved_database_path();
    info!("Database path: {}", db_path.display());
    let pool = init_database(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    let Some(api_key) = config.vision.api_key.clone() else {
        bail!("No Vision API key configured (set [vision] api_key or GOOGLE_VISION_API_KEY)");
    };
    let provider = VisionClient::new(
        config.vision.endpoint.clone(),
        api_key,
        config.vision.requests_per_second,
    )?;

    let meter: Arc<dyn UsageMeter> = match config.billing.stripe_key.clone() {
        Some(key) => {
            info!("Stripe usage metering enabled");
            Arc::new(StripeUsageMeter::new(config.billing.api_base.clone(), key)?)
        }
        None => {
            warn!("No Stripe key configured, usage metering disabled");
            Arc::new(NoopUsageMeter)
        }
    };

    let lock_wait_ms = config.filter.db_lock_wait_ms;
    let ledger = Arc::new(SqliteLicenseLedger::new(pool.clone(), lock_wait_ms));
    let classifier = Arc::new(BatchClassifier::new(
        Arc::new(SqliteAnnotationStore::new(pool, lock_wait_ms)),
        ledger.clone(),
        Arc::new(provider),
        meter,
        config.filter.trial_max_usage,
    ));

    let settings = FilterSettings::from_config(&config.filter);
    info!(
        trial_max_usage = config.filter.trial_max_usage,
        max_images_per_request = settings.max_images_per_request,
        provider_timeout_ms = config.filter.provider_timeout_ms,
        "Filter settings"
    );

    let state = AppState::new(classifier, ledger, settings);
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("purity-filter listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
