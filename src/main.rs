use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use fakelpm_lib::constants::DEFAULT_PORT;
use fakelpm_lib::{ClientConfig, Command, Frame, LpmClient, LpmServer, ServerConfig};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Loop-back demo: runs a simulated lamp power meter and downloads from it.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port for the local server.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::builder()
        .with_default_directive(cli.verbose.tracing_level_filter().into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let config = ServerConfig::default().with_bind(SocketAddr::from((Ipv4Addr::LOCALHOST, cli.port)));
    let server = LpmServer::bind(config).await.context("Failed to start server")?;
    let addr = server.local_addr()?;
    let handle = server.shutdown_handle();
    let server_task = tokio::spawn(server.run());

    match demo_download(addr).await {
        Ok(()) => info!("Demo download finished, press Ctrl+C to stop the server"),
        Err(e) => error!("Demo download failed: {:?}", e),
    }

    signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    info!("Ctrl+C received, shutting down gracefully.");
    handle.shutdown();
    server_task.await.context("Server task panicked")??;
    Ok(())
}

async fn demo_download(addr: SocketAddr) -> Result<()> {
    let mut client = LpmClient::connect(addr, ClientConfig::default()).await?;
    let download = client.download(Command::Total).await?;

    info!("Header block: {}", hex::encode(download.header.encode()));
    for (i, measurement) in download.measurements.iter().enumerate() {
        info!("Measurement {}: pole {}", i + 1, measurement.data.pole());
    }
    for reading in download.readings() {
        info!("{}", reading);
    }
    Ok(())
}
