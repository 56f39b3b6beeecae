//! Cryptographic core of the protocol:
//!   - RSA-OAEP (SHA-256) wrapping of workspace keys, so the shared
//!     AES key only ever crosses the wire as ciphertext
//!   - detached RSA PKCS#1 v1.5 (SHA-256) signatures over file content
//!   - AES-256-GCM content encryption with the workspace key
//!   - PBKDF2 credential hashing and HMAC-SHA256 ledger authentication
//!     for the server's data at rest

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::definitions::{
    KEY_SALT_SIZE, KeySalt, WORKSPACE_KEY_SIZE, WorkspaceKey, WrappedKeyRecord,
};

pub use error::CryptoError;

pub mod error;

const NONCE_SIZE: usize = 12;

const PBKDF2_ROUNDS: u32 = 600_000;

pub const CREDENTIAL_SALT_SIZE: usize = 16;
pub const CREDENTIAL_HASH_SIZE: usize = 32;

pub const MAC_KEY_SIZE: usize = 32;
pub const MAC_SIZE: usize = 32;

type HmacSha256 = Hmac<Sha256>;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Generate a fresh workspace key and salt.
pub fn generate_workspace_key() -> (WorkspaceKey, KeySalt) {
    let mut key = [0u8; WORKSPACE_KEY_SIZE];
    let mut salt = [0u8; KEY_SALT_SIZE];
    OsRng.fill_bytes(&mut key);
    OsRng.fill_bytes(&mut salt);

    (key.into(), salt.into())
}

/// Generate an RSA-2048 identity keypair.
pub fn generate_keypair() -> Result<(RsaPrivateKey, RsaPublicKey), CryptoError> {
    let private = RsaPrivateKey::new(&mut OsRng, 2048)?;
    let public = RsaPublicKey::from(&private);

    Ok((private, public))
}

/// Wrap a workspace key for one member. The salt is carried along in
/// plaintext: it is not secret, it just has to be identical across
/// all members' records.
pub fn wrap_key(
    key: &WorkspaceKey,
    salt: &KeySalt,
    member_key: &RsaPublicKey,
) -> Result<WrappedKeyRecord, CryptoError> {
    let wrapped_key = member_key.encrypt(&mut OsRng, Oaep::new::<Sha256>(), key.as_ref())?;

    Ok(WrappedKeyRecord {
        wrapped_key,
        salt: salt.clone(),
    })
}

/// Recover the workspace key from a wrapped record using the member's
/// private key.
pub fn unwrap_key(
    record: &WrappedKeyRecord,
    private_key: &RsaPrivateKey,
) -> Result<(WorkspaceKey, KeySalt), CryptoError> {
    let key: [u8; WORKSPACE_KEY_SIZE] = private_key
        .decrypt(Oaep::new::<Sha256>(), &record.wrapped_key)?
        .try_into()
        .map_err(|_| CryptoError::MalformedRecord)?;

    Ok((key.into(), record.salt.clone()))
}

/// Produce a detached signature over the full content.
pub fn sign_content(signing_key: &RsaPrivateKey, content: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let digest = sha256(content);
    Ok(signing_key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)?)
}

/// Verify a detached signature over the full content.
pub fn verify_content(
    verifying_key: &RsaPublicKey,
    content: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let digest = sha256(content);
    verifying_key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)?;

    Ok(())
}

/// Encrypt content under the workspace key (AES-256-GCM, salt bound
/// as associated data). Output is nonce || ciphertext.
pub fn encrypt_content(
    key: &WorkspaceKey,
    salt: &KeySalt,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    // path-qualified: importing `KeyInit` would make `new_from_slice`
    // ambiguous for the hmacs in this module
    let cipher = <Aes256Gcm as aes_gcm::KeyInit>::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher.encrypt(
        Nonce::from_slice(&nonce),
        Payload {
            msg: plaintext,
            aad: salt.as_ref(),
        },
    )?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);

    Ok(out)
}

pub fn decrypt_content(
    key: &WorkspaceKey,
    salt: &KeySalt,
    data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::Truncated);
    }
    let (nonce, ciphertext) = data.split_at(NONCE_SIZE);

    let cipher = <Aes256Gcm as aes_gcm::KeyInit>::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));
    Ok(cipher.decrypt(
        Nonce::from_slice(nonce),
        Payload {
            msg: ciphertext,
            aad: salt.as_ref(),
        },
    )?)
}

/// PBKDF2-HMAC-SHA256 hash of a credential with a fresh salt.
pub fn new_credential(secret: &str) -> ([u8; CREDENTIAL_SALT_SIZE], [u8; CREDENTIAL_HASH_SIZE]) {
    let mut salt = [0u8; CREDENTIAL_SALT_SIZE];
    OsRng.fill_bytes(&mut salt);

    (salt, hash_credential(secret, &salt))
}

pub fn hash_credential(secret: &str, salt: &[u8]) -> [u8; CREDENTIAL_HASH_SIZE] {
    let mut out = [0u8; CREDENTIAL_HASH_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, PBKDF2_ROUNDS, &mut out);
    out
}

pub fn verify_credential(secret: &str, salt: &[u8], expected: &[u8]) -> bool {
    let computed = hash_credential(secret, salt);
    // fold the comparison so it does not short-circuit
    computed.len() == expected.len()
        && computed
            .iter()
            .zip(expected)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// HMAC-SHA256 over a ledger file's bytes.
pub fn ledger_mac(key: &[u8], data: &[u8]) -> [u8; MAC_SIZE] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Data-at-rest tamper check; `label` names the file for the error.
pub fn verify_ledger_mac(
    key: &[u8],
    data: &[u8],
    tag: &[u8],
    label: &str,
) -> Result<(), CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.verify_slice(tag)
        .map_err(|_| CryptoError::MacMismatch(label.into()))
}

pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey, CryptoError> {
    let pem = std::fs::read_to_string(path)
        .map_err(|_| CryptoError::KeyFile(path.display().to_string()))?;
    RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|_| CryptoError::KeyFile(path.display().to_string()))
}

pub fn load_public_key(path: &Path) -> Result<RsaPublicKey, CryptoError> {
    let pem = std::fs::read_to_string(path)
        .map_err(|_| CryptoError::KeyFile(path.display().to_string()))?;
    RsaPublicKey::from_public_key_pem(&pem)
        .map_err(|_| CryptoError::KeyFile(path.display().to_string()))
}

pub fn save_private_key(key: &RsaPrivateKey, path: &Path) -> Result<(), CryptoError> {
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|_| CryptoError::KeyFile(path.display().to_string()))?;
    std::fs::write(path, pem.as_bytes())
        .map_err(|_| CryptoError::KeyFile(path.display().to_string()))
}

pub fn save_public_key(key: &RsaPublicKey, path: &Path) -> Result<(), CryptoError> {
    let pem = key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|_| CryptoError::KeyFile(path.display().to_string()))?;
    std::fs::write(path, pem.as_bytes())
        .map_err(|_| CryptoError::KeyFile(path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2048-bit keygen is slow enough to share across tests
    fn keypair() -> (RsaPrivateKey, RsaPublicKey) {
        use std::sync::OnceLock;
        static KEYS: OnceLock<(RsaPrivateKey, RsaPublicKey)> = OnceLock::new();
        KEYS.get_or_init(|| generate_keypair().unwrap()).clone()
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let (private, public) = keypair();
        let (key, salt) = generate_workspace_key();

        let record = wrap_key(&key, &salt, &public).unwrap();
        let (unwrapped, unwrapped_salt) = unwrap_key(&record, &private).unwrap();

        assert_eq!(unwrapped, key);
        assert_eq!(unwrapped_salt, salt);
    }

    #[test]
    fn rewrapping_preserves_key_bytes_across_members() {
        let (alice_private, alice_public) = keypair();
        let (bob_private, bob_public) = {
            let private = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
            let public = RsaPublicKey::from(&private);
            (private, public)
        };

        let (key, salt) = generate_workspace_key();
        let alice_record = wrap_key(&key, &salt, &alice_public).unwrap();

        // alice unwraps her record and re-wraps the same bytes for bob
        let (unwrapped, salt) = unwrap_key(&alice_record, &alice_private).unwrap();
        let bob_record = wrap_key(&unwrapped, &salt, &bob_public).unwrap();

        let (bob_key, bob_salt) = unwrap_key(&bob_record, &bob_private).unwrap();
        assert_eq!(bob_key, key);
        assert_eq!(bob_salt, alice_record.salt);
        // same key, different ciphertext
        assert_ne!(bob_record.wrapped_key, alice_record.wrapped_key);
    }

    #[test]
    fn sign_verify_and_bit_flip() {
        let (private, public) = keypair();
        let content = b"the quick brown fox".repeat(1000);

        let signature = sign_content(&private, &content).unwrap();
        verify_content(&public, &content, &signature).unwrap();

        for index in [0, content.len() / 2, content.len() - 1] {
            let mut tampered = content.clone();
            tampered[index] ^= 0x01;
            assert!(verify_content(&public, &tampered, &signature).is_err());
        }
    }

    #[test]
    fn content_encryption_round_trip() {
        let (key, salt) = generate_workspace_key();
        let plaintext = b"workspace file contents".to_vec();

        let sealed = encrypt_content(&key, &salt, &plaintext).unwrap();
        assert_ne!(sealed, plaintext);
        assert_eq!(decrypt_content(&key, &salt, &sealed).unwrap(), plaintext);

        // wrong salt (AAD) must fail
        let (_, other_salt) = generate_workspace_key();
        assert!(decrypt_content(&key, &other_salt, &sealed).is_err());

        assert!(matches!(
            decrypt_content(&key, &salt, &sealed[..4]),
            Err(CryptoError::Truncated)
        ));
    }

    #[test]
    fn credential_hashing() {
        let (salt, hash) = new_credential("hunter2");
        assert!(verify_credential("hunter2", &salt, &hash));
        assert!(!verify_credential("hunter3", &salt, &hash));
    }

    #[test]
    fn ledger_mac_detects_tampering() {
        let key = [7u8; MAC_KEY_SIZE];
        let tag = ledger_mac(&key, b"ws1:alice:alice,bob");

        verify_ledger_mac(&key, b"ws1:alice:alice,bob", &tag, "workspaces.txt").unwrap();
        assert!(matches!(
            verify_ledger_mac(&key, b"ws1:alice:alice,bob,eve", &tag, "workspaces.txt"),
            Err(CryptoError::MacMismatch(_))
        ));
    }

    #[test]
    fn pem_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (private, public) = keypair();

        let private_path = dir.path().join("alice.key.pem");
        let public_path = dir.path().join("alice.pem");
        save_private_key(&private, &private_path).unwrap();
        save_public_key(&public, &public_path).unwrap();

        assert_eq!(load_private_key(&private_path).unwrap(), private);
        assert_eq!(load_public_key(&public_path).unwrap(), public);
    }
}
