//! Offline node address commands.

use anyhow::{bail, Context, Result};
use meshgate_core::address::ADDRESS_LEN;
use meshgate_core::{Identity, NodeAddress};

/// Generate a fresh identity and print its seed and address.
pub fn cmd_address_new() -> Result<()> {
    let identity = Identity::generate();
    println!("seed    : {}", hex::encode(*identity.seed_bytes()));
    println!("address : {}", identity.address);
    Ok(())
}

pub fn cmd_address_encode(raw_hex: &str) -> Result<()> {
    let raw = hex::decode(raw_hex.trim()).context("address must be hex")?;
    if raw.len() != ADDRESS_LEN {
        bail!("expected {} bytes, got {}", ADDRESS_LEN, raw.len());
    }
    let mut bytes = [0u8; ADDRESS_LEN];
    bytes.copy_from_slice(&raw);
    println!("{}", NodeAddress::from_bytes(bytes));
    Ok(())
}

pub fn cmd_address_decode(encoded: &str) -> Result<()> {
    let addr: NodeAddress = encoded.trim().parse()?;
    println!("{}", hex::encode(addr.as_bytes()));
    Ok(())
}
