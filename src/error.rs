//! APCI link-layer error types.

use thiserror::Error;

/// Errors raised by the APCI connection layer.
///
/// The fatal variants (`Io`, `ResponseTimeout`, `SequenceMismatch`,
/// `StrayAck`, `MalformedFrame`, `PeerAborted`) terminate the connection;
/// callers of `send`/`drain`/`receive` observe them as a uniform
/// [`ApciError::ConnectionClosed`] once the link is down.
#[derive(Error, Debug)]
pub enum ApciError {
    /// IO error on the underlying byte stream
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection is closed or closing
    #[error("connection closed")]
    ConnectionClosed,

    /// An ack-waiting send was issued while data transfer is disabled
    #[error("data transfer disabled")]
    TransferDisabled,

    /// The peer failed to acknowledge or confirm within the response timeout (t1)
    #[error("response timeout expired")]
    ResponseTimeout,

    /// The peer aborted the link
    #[error("peer aborted the link")]
    PeerAborted,

    /// A data frame arrived out of order
    #[error("out-of-order data frame: expected sequence {expected}, got {got}")]
    SequenceMismatch { expected: u16, got: u16 },

    /// The peer acknowledged a sequence number that was never sent
    #[error("acknowledgment for frame never sent: {seq}")]
    StrayAck { seq: u16 },

    /// The codec could not parse an incoming frame
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Outgoing payload exceeds the maximum APDU payload size
    #[error("payload too large: {len} bytes")]
    PayloadTooLarge { len: usize },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Common result type for the APCI layer
pub type ApciResult<T> = Result<T, ApciError>;
