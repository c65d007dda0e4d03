//! natprobe - discover the public address and NAT type of this host

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use natprobe::{resolve, Client, ClientConfig, Discovery, Host, ProbePolicy, UdpTransport};

#[derive(Parser)]
#[command(name = "natprobe")]
#[command(about = "Discover the public address and NAT type of this host using STUN")]
#[command(version)]
struct Cli {
    /// STUN server (host[:port], default port 3478)
    #[arg(env = "NATPROBE_SERVER", default_value = "stun.ekiga.net:3478")]
    server: String,

    /// Do not send the SOFTWARE attribute
    #[arg(long)]
    no_software: bool,

    /// Do not send the FINGERPRINT attribute
    #[arg(long)]
    no_fingerprint: bool,

    /// Transmissions per probe
    #[arg(long, default_value = "9")]
    attempts: u32,

    /// Initial retransmission timeout in milliseconds
    #[arg(long, default_value = "100")]
    timeout_ms: u64,

    /// Retransmission timeout ceiling in milliseconds
    #[arg(long, default_value = "1600")]
    max_timeout_ms: u64,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    /// Keep the mapping alive, refreshing every SECS seconds until Ctrl+C
    #[arg(long, value_name = "SECS")]
    keepalive: Option<u64>,

    /// Enable verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn config(&self) -> Result<ClientConfig> {
        let policy = ProbePolicy::new(
            self.attempts,
            Duration::from_millis(self.timeout_ms),
            Duration::from_millis(self.max_timeout_ms),
        );
        let config = ClientConfig {
            software: !self.no_software,
            fingerprint: !self.no_fingerprint,
            ..ClientConfig::default()
        }
        .with_policy(policy);

        config.validate().map_err(|e| anyhow!(e))?;
        Ok(config)
    }
}

#[derive(Serialize)]
struct Report<'a> {
    server: SocketAddr,
    #[serde(flatten)]
    discovery: &'a Discovery,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose)?;

    let config = cli.config()?;
    let server = resolve(&cli.server).await?;
    info!("Using STUN server {} ({})", cli.server, server);

    match cli.keepalive {
        Some(secs) => {
            let period = Duration::from_secs(secs.max(1));
            run_keepalive(server, config, period, cli.json).await
        }
        None => {
            let discovery = Client::new(config).discover_addr(server).await?;
            print_report(server, &discovery, cli.json)
        }
    }
}

fn setup_logging(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

fn print_report(server: SocketAddr, discovery: &Discovery, json: bool) -> Result<()> {
    if json {
        let report = Report { server, discovery };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("NAT type:       {}", discovery.nat_type);
    match discovery.mapped {
        Some(host) => println!("Mapped address: {} ({})", host, host.family()),
        None => println!("Mapped address: unavailable"),
    }
    if discovery.nat_type.allows_hole_punching() {
        println!("Direct UDP connectivity is likely possible");
    }
    Ok(())
}

async fn run_keepalive(
    server: SocketAddr,
    config: ClientConfig,
    period: Duration,
    json: bool,
) -> Result<()> {
    let transport = Arc::new(UdpTransport::ephemeral_for(server).await?);
    let client = Client::with_connection(transport.clone(), config);

    let discovery = client.discover_addr(server).await?;
    print_report(server, &discovery, json)?;

    let mut current: Option<Host> = discovery.mapped;
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    println!("\nKeeping {} alive every {:?}.", transport.local_addr(), period);
    println!("Press Ctrl+C to stop.\n");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            _ = interval.tick() => {
                match client.keepalive_addr(server).await {
                    Ok(host) if Some(host) != current => {
                        match current {
                            Some(previous) => {
                                warn!("Mapping changed from {} to {}", previous, host)
                            }
                            None => info!("Mapped address: {}", host),
                        }
                        current = Some(host);
                    }
                    Ok(host) => info!("Mapping {} refreshed", host),
                    Err(e) => warn!("Keep-alive failed: {}", e),
                }
            }
        }
    }

    Ok(())
}
