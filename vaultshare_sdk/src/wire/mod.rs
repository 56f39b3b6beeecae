//! Length-prefixed, dual-format wire protocol.
//!
//! Every exchange is one request frame answered by one response
//! frame. Bodies are either STRUCTURED (a flat key/value map, see
//! [fields]) or BINARY (opaque bytes, used for chunk payloads).

pub mod error;
pub mod fields;
mod frame;

pub use error::FrameError;
pub use fields::Fields;
pub use frame::{
    Body, Kind, Message, Status, decode_request, decode_response, encode, read_frame,
    read_request, read_response, write_message,
};

/// Header key carrying the transfer id on binary chunk frames.
pub const HDR_FILE_ID: &str = "FILE-ID";
/// Header key carrying the zero-based chunk index.
pub const HDR_CHUNK_ID: &str = "CHUNK-ID";
/// Header key tagging the frame kind of a binary payload.
pub const HDR_TYPE: &str = "TYPE";

pub const TYPE_CHUNK: &str = "CHUNK";
pub const TYPE_SIGNATURE: &str = "SIGNATURE";
