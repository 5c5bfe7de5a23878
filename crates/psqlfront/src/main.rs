//! psql-front CLI entry point

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use psqlfront::{telemetry, Config, Server};

#[derive(Parser, Debug)]
#[command(name = "psql-front", version, about = "PostgreSQL read-through caching proxy")]
struct Args {
    /// Configuration file (path or http(s)/s3/gcs URL)
    #[arg(long, env = "PSQL_FRONT_CONFIG")]
    config: Option<String>,

    /// Port to listen on for PostgreSQL clients
    #[arg(long, env = "PSQL_FRONT_PORT", default_value_t = 5434)]
    port: u16,

    /// Log level (debug, info, notice, warn, error)
    #[arg(long, env = "PSQL_FRONT_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");
    dotenvy::dotenv().ok();

    let args = Args::parse();
    telemetry::init(&args.log_level)?;
    psqlfront::origin::register_builtin();

    let cfg = match &args.config {
        Some(path) => Config::load(path).await?,
        None => Config::default(),
    };
    cfg.validate_version(psqlfront::VERSION)?;

    let server = Server::new(&cfg).await?;

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
        signal_token.cancel();
    });

    server.run(token, &format!("0.0.0.0:{}", args.port)).await?;
    Ok(())
}
