//! Operator keypair loading
//!
//! The keypair file is the Solana CLI format: a JSON array of 64 bytes.

use std::path::Path;

use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Load the operator keypair, refusing group- or world-readable files
pub fn load_keypair(path: &Path) -> Result<Keypair> {
    debug!("Loading keypair from: {:?}", path);

    // Validate permissions on Unix
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(path) {
            let mode = metadata.permissions().mode();
            if mode & 0o077 != 0 {
                return Err(Error::InvalidKeypair(format!(
                    "Keypair has insecure permissions {:o}. Run 'chmod 600 {}'",
                    mode & 0o777,
                    path.display()
                )));
            }
        }
    }

    let keypair_bytes = std::fs::read(path)
        .map_err(|e| Error::InvalidKeypair(format!("Failed to read {}: {}", path.display(), e)))?;

    let keypair_json: Vec<u8> = serde_json::from_slice(&keypair_bytes)
        .map_err(|e| Error::InvalidKeypair(format!("Failed to parse keypair JSON: {}", e)))?;

    let keypair = Keypair::from_bytes(&keypair_json)
        .map_err(|e| Error::InvalidKeypair(format!("Invalid keypair bytes: {}", e)))?;

    info!("Operator wallet: {}", keypair.pubkey());
    Ok(keypair)
}
