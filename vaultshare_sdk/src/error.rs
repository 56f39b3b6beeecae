use crate::crypto::CryptoError;
use crate::server::StoreError;
use crate::transfer::TransferError;
use crate::transport::TransportError;
use crate::wire::{FrameError, Status};

/// Crate-wide error, aggregating the per-module errors plus the
/// client-side protocol failures.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    /// The server answered with a failure status.
    #[error("server answered {0}")]
    UnexpectedStatus(Status),
    #[error("response is missing the '{0}' field")]
    MissingField(&'static str),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    /// The downloaded file failed signature verification; both the
    /// file and its signature have been discarded.
    #[error("signature verification failed for '{0}'")]
    SignatureInvalid(String),
    #[error("no public key on the keyring for '{0}'")]
    UnknownSigner(String),
}
