use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use maestro_engine::mock::MockBackend;
use maestro_engine::CapabilityRegistry;
use maestro_server::ServerConfig;
use maestro_store::sessions::SessionRepo;
use maestro_store::Database;

#[derive(Parser)]
#[command(name = "maestro", about = "Session/task orchestration server for AI-agent conversations")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 9292)]
    port: u16,

    /// Database path. Defaults to ~/.maestro/maestro.db.
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let db_path = args
        .db
        .unwrap_or_else(|| home_dir().join(".maestro").join("maestro.db"));
    let db = Database::open(&db_path).expect("failed to open database");
    tracing::info!(path = %db_path.display(), "database opened");

    // Sessions left `running` by a previous process have no live runner.
    match SessionRepo::new(db.clone()).reset_running() {
        Ok(count) if count > 0 => {
            tracing::info!(count, "reset stale running sessions to idle");
        }
        Err(e) => tracing::warn!(error = %e, "failed to reset running sessions"),
        _ => {}
    }

    // No provider ships with the binary; deployments wire their own
    // ModelBackend through maestro_server::start.
    let backend = Arc::new(MockBackend::always_text(
        "No model backend is configured on this server.",
    ));
    let capabilities = Arc::new(CapabilityRegistry::new());

    let config = ServerConfig { port: args.port, ..Default::default() };
    let handle = maestro_server::start(config, db, backend, capabilities)
        .await
        .expect("failed to start server");

    tracing::info!(port = handle.port, "maestro ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    handle.shutdown();
    tracing::info!("shutting down");
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
