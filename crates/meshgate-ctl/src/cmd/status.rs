//! Daemon status, schema, shutdown commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json, post_json};

#[derive(Deserialize)]
struct StatusResponse {
    address: String,
    uptime_secs: u64,
    serving: bool,
    open_streams: usize,
    in_flight: usize,
}

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Meshgate Daemon Status");
    println!("═══════════════════════════════════════");
    println!("  Address      : {}", resp.address);
    println!("  Uptime       : {}s", resp.uptime_secs);
    if resp.serving {
        println!("  In flight    : {}", resp.in_flight);
        println!("  Open streams : {}", resp.open_streams);
    } else {
        println!("\n  Not serving an origin (client only).");
    }

    Ok(())
}

pub async fn cmd_schema_list(port: u16) -> Result<()> {
    #[derive(Deserialize)]
    struct SchemaListResponse {
        messages: Vec<SchemaItem>,
    }

    #[derive(Deserialize)]
    struct SchemaItem {
        name: String,
        type_tag: String,
    }

    let resp: SchemaListResponse = get_json(&format!("{}/schema", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Message Schema ({})", resp.messages.len());
    println!("═══════════════════════════════════════");

    for m in &resp.messages {
        println!("  {}  {}", m.type_tag, m.name);
    }

    Ok(())
}

pub async fn cmd_shutdown(port: u16) -> Result<()> {
    #[derive(Deserialize)]
    struct ShutdownResponse {
        message: String,
    }

    let resp: ShutdownResponse = post_json(&format!("{}/daemon/shutdown", base_url(port))).await?;
    println!("{}", resp.message);
    Ok(())
}
