use crate::crypto::CryptoError;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("i/o on server storage: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed ledger line {line} in '{file}'")]
    Malformed { file: String, line: usize },
    #[error("workspace '{0}' already exists")]
    WorkspaceExists(String),
    #[error("no such workspace '{0}'")]
    NoWorkspace(String),
    #[error("invalid name '{0}'")]
    InvalidName(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
