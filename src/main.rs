//! CLI entry point for potentiostat_daq
//!
//! - `serve`: run the job server
//! - `run`: run a job file directly on a channel, without a server
//! - `submit`: send a job file to a running server and print its records
//!
//! A job file holds `{"usb_port": ..., "channel": 1, "techniques": [{"tech_id": ..., "params": {...}}]}`.
//!
//! # Usage
//! ```bash
//! potentiostat_daq serve --mock --port 6001
//! potentiostat_daq submit job.json --server 127.0.0.1:6001 --json
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use potentiostat_daq::config::{AppConfig, LogFormat};
use potentiostat_daq::device::{MockDriver, Potentiostat};
use potentiostat_daq::logging;
use potentiostat_daq::network::{
    DataPayload, JobClient, JobRequest, JobServer, ServerContext, ServerSettings,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "potentiostat_daq")]
#[command(about = "Potentiostat technique host and job server", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the job server
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        /// Serve the simulated instrument
        #[arg(long)]
        mock: bool,
    },
    /// Run a job file on a channel of the simulated instrument
    Run {
        input: PathBuf,

        /// Print records as JSON lines
        #[arg(long)]
        json: bool,

        /// Seconds to wait for the channel to stop after Ctrl+C
        #[arg(long, default_value_t = 10)]
        stop_timeout: u64,
    },
    /// Submit a job file to a running server
    Submit {
        input: PathBuf,

        /// Server address, defaults to the configured host and port
        #[arg(long)]
        server: Option<String>,

        /// Print records as JSON lines
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
    .context("Failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    if let Commands::Serve { host, port, .. } = &cli.command {
        if let Some(host) = host {
            config.server.host = host.clone();
        }
        if let Some(port) = port {
            config.server.port = *port;
        }
    }
    config.validate()?;
    logging::init_from_config(&config.logging)?;

    match cli.command {
        Commands::Serve { mock, .. } => serve(&config, mock).await,
        Commands::Run {
            input,
            json,
            stop_timeout,
        } => run(&config, &input, json, Duration::from_secs(stop_timeout)).await,
        Commands::Submit {
            input,
            server,
            json,
        } => {
            let server = server.unwrap_or_else(|| config.server.bind_address());
            submit(&server, &input, json).await
        }
    }
}

fn read_job(path: &Path) -> Result<JobRequest> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid job file {}", path.display()))
}

fn print_record(payload: &DataPayload, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(payload)?);
    } else {
        println!("[{}] {}: {}", payload.tech_index, payload.tech_id, payload.data);
    }
    Ok(())
}

async fn serve(config: &AppConfig, mock: bool) -> Result<()> {
    if !mock {
        bail!("no hardware driver is built in; start the server with --mock");
    }
    let driver = MockDriver::new(config.instrument.mock.clone());
    let context = ServerContext::new(Arc::new(driver), ServerSettings::from(config));
    let server = JobServer::bind(&config.server.bind_address(), context).await?;
    info!("Serving the simulated instrument, Ctrl+C to stop");
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

async fn run(config: &AppConfig, input: &Path, json: bool, stop_timeout: Duration) -> Result<()> {
    let job = read_job(input)?.into_job(&config.instrument.default_address)?;
    let driver = MockDriver::new(config.instrument.mock.clone());
    let device =
        Potentiostat::connect(&driver, &job.address, config.instrument.connect_options()).await?;
    let number = usize::try_from(job.channel).unwrap_or(0);
    let channel = device.get_channel(number)?;
    let mut runner = channel.run_techniques(job.techniques).await?;
    let data_wait = Duration::from_millis(config.server.data_wait_ms);

    let interrupt = CancellationToken::new();
    let watcher = tokio::spawn({
        let interrupt = interrupt.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupted, stopping the run");
                    interrupt.cancel();
                }
                Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
            }
        }
    });

    let outcome = runner
        .drain(&interrupt, data_wait, |data| {
            print_record(&DataPayload::from(&data), json)
        })
        .await;
    watcher.abort();
    if let Err(e) = outcome {
        device.close().await?;
        return Err(e);
    }

    if interrupt.is_cancelled() {
        let deadline = Instant::now() + stop_timeout;
        while channel.is_busy().await? {
            if Instant::now() >= deadline {
                warn!("Channel {} did not stop within {:?}", channel.number(), stop_timeout);
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    let metadata = runner.metadata().await?;
    info!(
        status = %metadata.status,
        channel = metadata.channel,
        "Run finished"
    );
    device.close().await?;
    Ok(())
}

async fn submit(server: &str, input: &Path, json: bool) -> Result<()> {
    let request = read_job(input)?;
    let mut client = JobClient::connect(server).await?;
    client.submit(&request).await?;
    while let Some(payload) = client.next_record().await? {
        print_record(&payload, json)?;
    }
    Ok(())
}
