// Error type for framing and message decoding.
//
// Framing errors (`TruncatedHeader`, `TruncatedBody`, `MalformedPayload`,
// `UnknownKind`, `TooLarge`) are always fatal to the connection they came
// from. `ConnectionClosed` is the peer hanging up cleanly between messages.
// `Io` wraps any other transport failure.

use std::io;

use thiserror::Error;

/// Errors produced while writing or reading framed messages.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The stream ended cleanly before the first byte of a message.
    #[error("connection closed")]
    ConnectionClosed,

    /// The stream ended inside the 4-byte length prefix.
    #[error("stream closed inside the length prefix")]
    TruncatedHeader,

    /// The stream ended before the announced block was complete.
    #[error("stream closed inside a {expected}-byte message body")]
    TruncatedBody { expected: u32 },

    /// The block decompressed or parsed to something that isn't a message.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The discriminator names no known kind.
    #[error("unknown message kind: {0:?}")]
    UnknownKind(String),

    /// Announced or produced size exceeds `MAX_MESSAGE_SIZE`.
    #[error("message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: u32 },

    /// Any other transport failure.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// True for a clean hang-up between messages.
    pub fn is_closed(&self) -> bool {
        matches!(self, CodecError::ConnectionClosed)
    }
}

/// Result alias for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;
