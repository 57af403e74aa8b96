//! Node identity — the persisted seed the node address is derived from.
//!
//! The seed is 32 random bytes stored hex-encoded at `identity.seed_path`.
//! The node address is BLAKE3(seed); the seed itself never leaves this
//! module except through `seed_bytes()`.

use std::path::{Path, PathBuf};

use rand::RngCore;
use zeroize::Zeroizing;

use crate::address::NodeAddress;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("failed to read identity {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to write identity {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("identity file {0} is not a 32-byte hex seed")]
    Corrupt(PathBuf),
}

pub struct Identity {
    seed: Zeroizing<[u8; 32]>,
    pub address: NodeAddress,
}

impl Identity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(seed.as_mut());
        Self::from_seed(*seed)
    }

    /// Reconstruct an identity from stored seed bytes.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let address = NodeAddress::derive(&seed);
        Self {
            seed: Zeroizing::new(seed),
            address,
        }
    }

    pub fn seed_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.seed)
    }

    /// Load the seed at `path`, generating and persisting one if missing.
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            let text = Zeroizing::new(
                std::fs::read_to_string(path)
                    .map_err(|e| IdentityError::ReadFailed(path.to_path_buf(), e))?,
            );
            let mut seed = Zeroizing::new([0u8; 32]);
            hex::decode_to_slice(text.trim(), seed.as_mut())
                .map_err(|_| IdentityError::Corrupt(path.to_path_buf()))?;
            return Ok(Self::from_seed(*seed));
        }

        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| IdentityError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = Zeroizing::new(hex::encode(*identity.seed));
        std::fs::write(path, text.as_bytes())
            .map_err(|e| IdentityError::WriteFailed(path.to_path_buf(), e))?;
        restrict_permissions(path)
            .map_err(|e| IdentityError::WriteFailed(path.to_path_buf(), e))?;
        Ok(identity)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
