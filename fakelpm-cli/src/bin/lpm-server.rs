use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use fakelpm_cli::{setup_logging, shutdown_signal};
use fakelpm_lib::archive::ArchiveSource;
use fakelpm_lib::clock::{Clock, SystemClock, ZoneSpec};
use fakelpm_lib::constants::DEFAULT_PORT;
use fakelpm_lib::source::{MeasurementSource, RandomSource};
use fakelpm_lib::{LpmServer, ServerConfig, SessionConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SourceKind {
    /// Freshly generated records
    Random,
    /// Replay of the built-in historical samples
    Archive,
}

/// Lamp power meter simulator: serves measurement downloads over TCP.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TCP port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Address to bind.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,
    /// Zone for header timestamps: `local`, `utc` or an offset like `+01:00`.
    #[arg(short, long, default_value = "local")]
    timezone: String,
    /// How long to wait for each client ACK, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    ack_timeout_ms: u64,
    /// Where measurement records come from.
    #[arg(long, value_enum, default_value_t = SourceKind::Random)]
    source: SourceKind,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.clone(), &cli.verbose)?;

    if let Err(e) = run(cli).await {
        error!("Server failed: {:?}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let zone = ZoneSpec::resolve(&cli.timezone);
    let config = ServerConfig::default()
        .with_bind(SocketAddr::new(cli.bind, cli.port))
        .with_zone(zone)
        .with_session(SessionConfig::default().with_ack_timeout(Duration::from_millis(cli.ack_timeout_ms)));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(zone));
    let source: Arc<dyn MeasurementSource> = match cli.source {
        SourceKind::Random => Arc::new(RandomSource::new(clock.clone())),
        SourceKind::Archive => Arc::new(ArchiveSource::samples().context("Failed to load sample archive")?),
    };

    let server = LpmServer::bind(config)
        .await
        .with_context(|| format!("Failed to bind {}:{}", cli.bind, cli.port))?
        .with_clock(clock)
        .with_source(source);
    info!(zone = %zone, source = ?cli.source, "Serving downloads");

    let handle = server.shutdown_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        handle.shutdown();
    });

    server.run().await?;
    info!("Server shut down");
    Ok(())
}
