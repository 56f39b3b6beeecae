use super::fields::FieldError;

/// Maximum accepted frame size (the length prefix), leaving ample room
/// for one 64 KiB chunk plus headers.
pub const MAX_FRAME_LEN: u32 = 1 << 20;

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("i/o while framing: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    Oversize(u32),
    #[error("truncated frame")]
    Truncated,
    #[error("unknown body format tag {0:?}")]
    UnknownFormat([u8; 4]),
    #[error("invalid correlation id '{0}'")]
    CorrelationId(String),
    #[error("missing header/body separator")]
    MissingSeparator,
    #[error("malformed header line '{0}'")]
    Header(String),
    #[error("invalid route name '{0}'")]
    Route(String),
    #[error("unknown status code '{0}'")]
    Status(String),
    #[error("structured body is not valid UTF-8")]
    Utf8,
    #[error("malformed structured body: {0}")]
    Fields(#[from] FieldError),
}
