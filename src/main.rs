use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;
use splitdns::config::Config;
use splitdns::server::DnsServer;
use splitdns::upstream::Transports;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

/// Forwarding DNS proxy that routes domains to different upstream resolvers
#[derive(Parser, Debug)]
#[command(name = "splitdns")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "splitdns.yaml")]
    config: PathBuf,

    /// Enable debug logging (also settable via `debug` in the config file)
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;

    let level = if args.debug || config.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    Builder::from_default_env().filter_level(level).init();

    // Print configuration to stdout (always visible)
    println!("splitdns v{}", env!("CARGO_PKG_VERSION"));
    println!("Configuration:");
    for addr in &config.listen {
        println!("  Listen: {addr}");
    }
    println!("  Forward rules: {}", config.forward_rules.len());
    println!("  Default upstreams: {}", config.default_upstream.len());
    println!("  Blacklisted addresses: {}", config.blacklist.len());
    println!("  Race timeout: {}s", config.timeout);
    println!();

    let config = Arc::new(config);
    let exchange = Arc::new(Transports::new()?);
    let server = DnsServer::new(Arc::clone(&config), exchange);

    println!("Server is running. Press Ctrl+C to stop\n");

    tokio::select! {
        result = server.run() => result,
        _ = signal::ctrl_c() => {
            println!("\nShutdown signal received, stopping server...");
            Ok(())
        }
    }
}
