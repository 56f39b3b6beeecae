#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("RSA operation failed: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("encryption or decryption failed")]
    Aead(#[from] aes_gcm::Error),
    #[error("ciphertext too short")]
    Truncated,
    #[error("could not read key material from '{0}'")]
    KeyFile(String),
    #[error("malformed wrapped key record")]
    MalformedRecord,
    #[error("MAC mismatch on '{0}'")]
    MacMismatch(String),
}
