use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use layer_tiles::archive_server::ArchiveHttpServer;
use layer_tiles::config::Config;
use layer_tiles::context::FeatureContextServer;
use layer_tiles::http::{self, AppState};
use layer_tiles::layer::LayerCatalog;
use layer_tiles::postgis::PostgisEncoder;
use layer_tiles::tile_server::VectorTileServer;
use layer_tiles::Error;

#[derive(Parser, Clone, Debug)]
#[command(version, about = "Serve layer archives and vector tiles", long_about = None)]
struct Cli {
    #[clap(long, help = "Path to the YAML configuration file")]
    config: PathBuf,
    #[clap(long, help = "Address to bind the server to, overriding the configuration")]
    bind: Option<SocketAddr>,
    #[clap(
        long,
        value_enum,
        default_value = "info",
        help = "Log level (error, warn, info, debug, trace)"
    )]
    log_level: LogLevel,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Cli::parse();
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::builder().from_env_lossy()
    } else {
        EnvFilter::builder().parse_lossy(format!("layer_tiles={}", args.log_level.as_str()))
    };

    let _ = tracing_subscriber::fmt::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::new(
            "%Y-%m-%d %H:%M:%S%.3f".to_string(),
        ))
        .try_init();

    let config = Config::load(&args.config)?;
    let addr = args.bind.unwrap_or(config.bind);
    info!(
        config = %args.config.display(),
        layers = config.layers.len(),
        tenant = config.tenant.as_deref().unwrap_or("public"),
        "loaded configuration"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect_lazy(&config.database_url)?;

    let catalog: Arc<dyn LayerCatalog> = Arc::new(config.catalog());
    let encoder = Arc::new(PostgisEncoder::new(pool));
    let tiles = VectorTileServer::new(catalog.clone(), encoder.clone(), config.tenant.clone());
    let context = FeatureContextServer::new(catalog.clone(), encoder, config.tenant.clone());
    let archives = ArchiveHttpServer::with_root(config.archive_root.clone());

    let state = AppState::new(catalog, tiles, archives, context);
    http::serve(addr, http::router(state)).await
}
