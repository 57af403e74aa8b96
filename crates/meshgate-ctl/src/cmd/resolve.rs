//! Directory lookup.

use anyhow::{bail, Context, Result};
use meshgate_core::NodeAddress;
use serde::Deserialize;

#[derive(Deserialize)]
struct PublishRecord {
    endpoint: String,
    valid_until: std::time::SystemTime,
}

pub async fn cmd_resolve(directory: &str, address: &str) -> Result<()> {
    let addr: NodeAddress = address.trim().parse()?;
    let url = format!("{}/records/{}", directory.trim_end_matches('/'), addr);

    let resp = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to reach directory at {}", directory))?;
    if resp.status() == reqwest::StatusCode::NOT_FOUND {
        bail!("{} is not published", addr.short());
    }
    let record: PublishRecord = resp
        .error_for_status()
        .with_context(|| format!("lookup at {} failed", url))?
        .json()
        .await
        .context("failed to parse record")?;

    let remaining = record
        .valid_until
        .duration_since(std::time::SystemTime::now())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("  ┌─ {}", addr);
    println!("  │  endpoint : {}", record.endpoint);
    println!("  └─ expires  : in {}s", remaining);
    Ok(())
}
