//! Data-at-rest tamper detection for the server's flat-file ledgers.
//!
//! Each ledger carries a sibling `.mac` file holding an HMAC-SHA256
//! tag under a key private to the server. The tags are consulted once
//! at startup; a mismatch aborts startup entirely, since serving from
//! unverified trust roots is worse than not serving.

use rand::RngCore;
use rand::rngs::OsRng;
use std::path::{Path, PathBuf};

use super::error::StoreError;
use crate::crypto::{self, MAC_KEY_SIZE};

pub fn mac_path(ledger: &Path) -> PathBuf {
    let mut name = ledger.file_name().unwrap_or_default().to_os_string();
    name.push(".mac");
    ledger.with_file_name(name)
}

/// Load the server's MAC key, generating one on first run.
pub fn load_or_create_mac_key(path: &Path) -> Result<Vec<u8>, StoreError> {
    match std::fs::read(path) {
        Ok(key) if key.len() == MAC_KEY_SIZE => Ok(key),
        Ok(_) => Err(StoreError::Malformed {
            file: path.display().to_string(),
            line: 0,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut key = vec![0u8; MAC_KEY_SIZE];
            OsRng.fill_bytes(&mut key);
            std::fs::write(path, &key)?;
            Ok(key)
        }
        Err(e) => Err(e.into()),
    }
}

/// Verify a ledger against its MAC file. A ledger that does not exist
/// yet is fine (first run); a ledger without a tag, or with a wrong
/// tag, is treated as tampering.
pub fn verify_file_authenticity(ledger: &Path, key: &[u8]) -> Result<(), StoreError> {
    let label = ledger.display().to_string();

    let data = match std::fs::read(ledger) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let tag = std::fs::read(mac_path(ledger))
        .map_err(|_| crypto::CryptoError::MacMismatch(label.clone()))?;
    crypto::verify_ledger_mac(key, &data, &tag, &label)?;

    Ok(())
}

/// Rewrite a ledger's MAC tag after a mutation.
pub fn stamp(ledger: &Path, key: &[u8]) -> Result<(), StoreError> {
    let data = std::fs::read(ledger)?;
    std::fs::write(mac_path(ledger), crypto::ledger_mac(key, &data))?;

    Ok(())
}
