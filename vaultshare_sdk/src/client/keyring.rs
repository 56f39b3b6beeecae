//! Local directory of peer public keys, one `<identity>.pem` each.
//!
//! Signature verification trusts keys distributed out of band; the
//! server never vouches for a signer's public key.

use rsa::RsaPublicKey;
use std::path::PathBuf;

use crate::Error;
use crate::crypto;

pub struct KeyRing {
    dir: PathBuf,
}

impl KeyRing {
    pub fn new(dir: impl Into<PathBuf>) -> KeyRing {
        KeyRing { dir: dir.into() }
    }

    /// Look up the public key for an identity. Signer names come off
    /// the wire, so they are validated before touching the
    /// filesystem.
    pub fn public_key(&self, identity: &str) -> Result<RsaPublicKey, Error> {
        let well_formed = !identity.is_empty()
            && identity
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if !well_formed {
            return Err(Error::UnknownSigner(identity.to_string()));
        }

        let path = self.dir.join(format!("{identity}.pem"));
        if !path.exists() {
            return Err(Error::UnknownSigner(identity.to_string()));
        }

        Ok(crypto::load_public_key(&path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_up_stored_keys_and_rejects_hostile_names() {
        let dir = tempfile::tempdir().unwrap();
        let (_, public) = crypto::generate_keypair().unwrap();
        crypto::save_public_key(&public, &dir.path().join("alice.pem")).unwrap();

        let ring = KeyRing::new(dir.path());
        assert_eq!(ring.public_key("alice").unwrap(), public);
        assert!(matches!(
            ring.public_key("bob"),
            Err(Error::UnknownSigner(_))
        ));
        assert!(matches!(
            ring.public_key("../alice"),
            Err(Error::UnknownSigner(_))
        ));
    }
}
