use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dicom_router::AppContext;
use dicom_router::config::AppConfig;
use dicom_router::logging::init_logging;
use dicom_router::server::tls::install_crypto_provider;
use tracing::{error, info};

/// How long pipelines get to drain their in-flight objects on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// XML configuration file
    #[arg(short, long, env = "ROUTER_CONFIG", default_value = "config.xml")]
    config: PathBuf,

    /// Directory for the rolling log files
    #[arg(long, env = "ROUTER_LOG_DIR", default_value = "logs")]
    log_dir: PathBuf,

    /// Host name advertised in URLs handed to other systems
    #[arg(long, env = "ROUTER_HOST")]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    install_crypto_provider();

    let (logging, _guard) = init_logging(&args.log_dir).context("Failed to initialize logging")?;

    let config = AppConfig::load(&args.config)
        .await
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;
    info!(
        "dicom-router {} starting with {}",
        env!("CARGO_PKG_VERSION"),
        args.config.display()
    );

    let context = Arc::new(
        AppContext::build(config, args.host.as_deref())
            .await
            .with_logging(logging),
    );
    context.start().await.context("Failed to start the admin server")?;
    if let Some(addr) = context.admin_addr() {
        info!("Admin server listening on {}", addr);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested");

    if !context.shutdown(SHUTDOWN_TIMEOUT).await {
        error!("Some pipelines did not stop cleanly");
    }
    info!("dicom-router stopped");
    Ok(())
}
