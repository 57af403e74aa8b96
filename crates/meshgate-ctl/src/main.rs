//! meshgate-ctl — command-line interface for the meshgate daemon.

use anyhow::{Context, Result};
use meshgate_core::MeshgateConfig;

mod cmd;

const DEFAULT_PORT: u16 = 9001;

fn print_usage() {
    println!("Usage: meshgate-ctl [--port <port>] [--directory <url>] <command>");
    println!();
    println!("Commands:");
    println!("  status                 Show daemon status and stream counts");
    println!("  schema                 List message names and type tags");
    println!("  shutdown               Stop the daemon");
    println!("  address new            Generate a seed and its node address");
    println!("  address encode <hex>   Encode 32 raw bytes as a node address");
    println!("  address decode <addr>  Decode a node address to hex");
    println!("  resolve <addr>         Look up a node in the directory");
    println!();
    println!("Options:");
    println!("  --port <port>       API port (default: {})", DEFAULT_PORT);
    println!("  --directory <url>   Directory base URL (default: from the daemon config)");
}

/// The directory the daemon itself uses, read from its config file.
fn configured_directory() -> Result<String> {
    let config = MeshgateConfig::load().context("failed to load config")?;
    config
        .discovery
        .lookup_url()
        .context("no directory configured; pass --directory or set discovery.directory_url")
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut port = DEFAULT_PORT;
    let mut directory: Option<String> = None;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                port = args
                    .get(i)
                    .context("--port requires a value")?
                    .parse()
                    .context("--port must be a number")?;
            }
            "--directory" => {
                i += 1;
                directory = Some(
                    args.get(i)
                        .context("--directory requires a value")?
                        .clone(),
                );
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | [] => cmd::status::cmd_status(port).await,
        ["schema"] => cmd::status::cmd_schema_list(port).await,
        ["shutdown"] => cmd::status::cmd_shutdown(port).await,
        ["address", "new"] => cmd::address::cmd_address_new(),
        ["address", "encode", raw] => cmd::address::cmd_address_encode(raw),
        ["address", "decode", addr] => cmd::address::cmd_address_decode(addr),
        ["resolve", addr] => {
            let directory = match directory {
                Some(d) => d,
                None => configured_directory()?,
            };
            cmd::resolve::cmd_resolve(&directory, addr).await
        }
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
