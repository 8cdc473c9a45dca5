//! Wire-level error types.

/// Everything that can go wrong between the socket and a decoded frame.
///
/// `Desync` and `FieldTooLarge` indicate the inbound byte stream can no
/// longer be trusted; both are terminal for the connection that produced
/// them. `Io` covers short reads/writes and underlying socket failures.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Short read/write or an underlying socket failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The inbound stream no longer lines up with frame boundaries:
    /// a header without the sync pattern, an unknown message code, or a
    /// body field that cannot be parsed.
    #[error("stream desynchronized: {reason}")]
    Desync {
        /// What the decoder tripped over.
        reason: String,
    },

    /// A length-prefixed field announced more bytes than the protocol
    /// admits. Validated before any allocation.
    #[error("field of {len} bytes exceeds the {max} byte limit")]
    FieldTooLarge {
        /// Announced field length.
        len: usize,
        /// Maximum admissible length.
        max: usize,
    },
}

impl WireError {
    pub(crate) fn desync(reason: impl Into<String>) -> Self {
        Self::Desync {
            reason: reason.into(),
        }
    }
}
