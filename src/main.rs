use anyhow::{anyhow, Context};
use clap::Parser;
use std::net::SocketAddr;
use tokio::net::lookup_host;
use tokio::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use tftp_client::{Cli, Client, ClientConfig, Command, RetryPolicy};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let default_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let server = resolve(&args.host, args.port).await?;
    let config = ClientConfig {
        server,
        retry: RetryPolicy {
            timeout: Duration::from_millis(args.timeout),
            max_retransmits: args.retry,
        },
    };
    let client = Client::new(config);

    let remote = args
        .file
        .file_name()
        .ok_or(anyhow!("{:?}", args.file))?
        .to_str()
        .ok_or(anyhow!("Illegal characters"))?;

    let start = Instant::now();
    let size = match args.command {
        Command::Read => {
            let data = client
                .read(remote)
                .await
                .with_context(|| format!("reading {remote} from {server}"))?;
            tokio::fs::write(&args.file, &data)
                .await
                .with_context(|| format!("writing {}", args.file.display()))?;
            println!("File saved ({} bytes)", data.len());
            data.len()
        }
        Command::Write => {
            let data = tokio::fs::read(&args.file)
                .await
                .with_context(|| format!("reading {}", args.file.display()))?;
            let sent = client
                .write(remote, data)
                .await
                .with_context(|| format!("writing {remote} to {server}"))?;
            println!("File sent ({sent} bytes)");
            sent
        }
    };

    let cost = start.elapsed();
    println!(
        "cost: {:.3}s, speed: {:.2} KB/s",
        cost.as_secs_f64(),
        size as f64 / cost.as_secs_f64() / 1024.0
    );
    Ok(())
}

async fn resolve(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let addrs = lookup_host((host, port))
        .await
        .with_context(|| format!("resolving {host}"))?;
    pick_server(addrs).ok_or(anyhow!("no address for {host}"))
}

// Servers commonly listen on IPv4 only, so prefer it even when the resolver
// lists an IPv6 address first.
fn pick_server(addrs: impl IntoIterator<Item = SocketAddr>) -> Option<SocketAddr> {
    let addrs: Vec<SocketAddr> = addrs.into_iter().collect();
    addrs
        .iter()
        .copied()
        .find(SocketAddr::is_ipv4)
        .or_else(|| addrs.first().copied())
}
