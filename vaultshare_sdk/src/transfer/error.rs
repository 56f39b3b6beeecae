#[derive(thiserror::Error, Debug)]
pub enum TransferError {
    #[error("unknown transfer '{0}'")]
    NotFound(String),
    #[error("transfer '{0}' does not belong to the caller")]
    NotOwner(String),
    #[error("transfer '{0}' is already complete")]
    AlreadyComplete(String),
    #[error("chunk {got} arrived out of order (expected {expected}); transfer aborted")]
    OutOfOrder { expected: u32, got: u32 },
    #[error("chunk {got} is past the end of the transfer ({total} chunks); transfer aborted")]
    PastEnd { got: u32, total: u32 },
    #[error("transfer '{0}' is missing chunks")]
    Incomplete(String),
    #[error("declared chunk count {declared} does not match declared size {size}")]
    Declaration { declared: u32, size: u64 },
    #[error("i/o during transfer: {0}")]
    Io(#[from] std::io::Error),
}
