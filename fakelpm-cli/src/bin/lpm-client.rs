use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use fakelpm_cli::{parse_code, setup_logging};
use fakelpm_lib::constants::DEFAULT_PORT;
use fakelpm_lib::{ClientConfig, Command, Download, LpmClient};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

/// Downloads measurements from a lamp power meter: one total, then one partial download.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Server port.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Server host.
    #[arg(long, default_value = "localhost")]
    host: String,
    /// Deadline for every read and write, in seconds.
    #[arg(long, default_value_t = 15)]
    timeout_secs: u64,
    /// User code sent with each request.
    #[arg(long, default_value = "0000", value_parser = parse_code)]
    user_code: [u8; 4],
    /// Plant code sent with each request.
    #[arg(long, default_value = "0000", value_parser = parse_code)]
    plant_code: [u8; 4],
    /// Print decoded readings as JSON on stdout.
    #[arg(long)]
    json: bool,
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
        error!("Client failed: {:?}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let addr = format!("{}:{}", cli.host, cli.port);
    let config = ClientConfig::default()
        .with_timeout(Duration::from_secs(cli.timeout_secs))
        .with_codes(cli.user_code, cli.plant_code);

    // The server closes the connection after each download
    for command in [Command::Total, Command::Partial] {
        let mut client = LpmClient::connect(addr.as_str(), config)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;
        let download = client
            .download(command)
            .await
            .with_context(|| format!("{} download failed", command))?;
        report(command, &download, cli.json)?;
    }
    Ok(())
}

fn report(command: Command, download: &Download, json: bool) -> Result<()> {
    let header = &download.header;
    info!(
        "{} header: user={} plant={} clock={:?}",
        command,
        String::from_utf8_lossy(&header.user_code),
        String::from_utf8_lossy(&header.plant_code),
        header.date_time()
    );
    info!("{} download returned {} measurements", command, download.measurements.len());

    let readings = download.readings();
    if json {
        println!("{}", serde_json::to_string_pretty(&readings)?);
    } else {
        for reading in &readings {
            info!("{}", reading);
        }
    }
    Ok(())
}
