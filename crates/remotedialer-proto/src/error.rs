//! Framing errors
//!
//! Every variant here is fatal to the session that produced it: message
//! boundaries cannot be recovered once a header is misread.

/// Error decoding or encoding a [`crate::Message`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtoError {
    /// The frame ended before a complete header was read
    #[error("truncated message header")]
    Truncated,

    /// A varint ran past ten bytes or overflowed 64 bits
    #[error("varint overflows a 64-bit integer")]
    VarintOverflow,

    /// A Connect or AddClient/RemoveClient payload exceeded the protocol limit
    #[error("{kind} payload is {len} bytes, limit is {limit}")]
    PayloadTooLarge {
        /// Message type carrying the payload
        kind: &'static str,
        /// Actual payload length
        len: usize,
        /// Allowed payload length
        limit: usize,
    },

    /// A Connect payload was not of the form `proto/address`
    #[error("malformed connect target: {0:?}")]
    MalformedConnect(String),

    /// A text payload was not valid UTF-8
    #[error("{0} payload is not valid UTF-8")]
    InvalidUtf8(&'static str),
}
