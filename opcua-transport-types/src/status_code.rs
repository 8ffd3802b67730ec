//! The subset of the OPC UA `StatusCode` space used by the transport layer.
//!
//! The full status code space is part of the data-model layer and is out of scope here;
//! this only carries the codes the framing, secure channel and connection FSM actually produce.

/// A status/result code carried in chunk headers, responses and internal errors.
///
/// `Good` (`0x0000_0000`) is the only non-`Bad_*` value used by this layer; everything else
/// has the high bit set, matching the real OPC UA encoding, though this layer does not need
/// the full bitmask of severities and info flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum StatusCode {
    /// Operation completed successfully.
    Good,
    /// An unexpected error occurred that cannot be further categorized.
    BadUnexpectedError,
    /// An internal error occurred as a result of a programming or configuration error.
    BadInternalError,
    /// Ran out of memory during an operation.
    BadOutOfMemory,
    /// An operation was not completed because a necessary resource was not available.
    BadResourceUnavailable,
    /// A low-level communication error occurred.
    BadCommunicationError,
    /// An operation timed out.
    BadTimeout,
    /// The server is shutting down.
    BadShutdown,
    /// The connection has been closed by the peer.
    BadConnectionClosed,
    /// The connection is not open.
    BadNotConnected,
    /// The HEL/ACK message type was not recognised.
    BadTcpMessageTypeInvalid,
    /// A message exceeded the locally configured receive buffer size.
    BadTcpMessageTooLarge,
    /// The endpoint URL given in a HELLO message does not resolve to a known server.
    BadTcpEndpointUrlInvalid,
    /// The peer's protocol version is older than this implementation supports.
    BadProtocolVersionUnsupported,
    /// A chunk's secure channel id did not match the channel it arrived on.
    BadSecureChannelIdInvalid,
    /// A chunk's security token id matched neither the current nor the previous token.
    BadSecureChannelTokenUnknown,
    /// The secure channel referenced by a request is unknown to the peer.
    BadTcpSecureChannelUnknown,
    /// A chunk or message's sequence number was not the expected value.
    BadSequenceNumberInvalid,
    /// Signature verification or other security check failed.
    BadSecurityChecksFailed,
    /// A certificate supplied by the peer was invalid.
    BadCertificateInvalid,
    /// The requested security policy is not supported.
    BadSecurityPolicyRejected,
    /// A nonce had the wrong length or was otherwise invalid.
    BadNonceInvalid,
    /// Decoding a value from the wire failed.
    BadDecodingError,
    /// Encoding a value to the wire failed.
    BadEncodingError,
    /// The encoded size of a message or value exceeded a configured limit.
    BadEncodingLimitsExceeded,
    /// A request message was larger than the channel's negotiated max message size.
    BadRequestTooLarge,
    /// A response message was larger than the channel's negotiated max message size.
    BadResponseTooLarge,
    /// An application-level request could not be serviced.
    BadInvalidState,
    /// Generic not-found style status for an unrecognised request id.
    BadRequestIdUnknown,
}

impl StatusCode {
    /// `true` if this is the `Good` status, `false` for every `Bad_*` variant.
    pub fn is_good(self) -> bool {
        matches!(self, StatusCode::Good)
    }

    /// `true` for every `Bad_*` variant.
    pub fn is_bad(self) -> bool {
        !self.is_good()
    }

    /// The wire encoding of this status code.
    ///
    /// Only the top bit and a handful of bit groups of the real OPC UA status code layout
    /// are meaningful to this layer, so this uses a small dense table rather than
    /// replicating the full bitmask semantics of the data-model layer.
    pub fn as_u32(self) -> u32 {
        match self {
            StatusCode::Good => 0x0000_0000,
            StatusCode::BadUnexpectedError => 0x8000_0000,
            StatusCode::BadInternalError => 0x8000_4000,
            StatusCode::BadOutOfMemory => 0x8000_8000,
            StatusCode::BadResourceUnavailable => 0x8000_C000,
            StatusCode::BadCommunicationError => 0x8001_0000,
            StatusCode::BadTimeout => 0x8001_8000,
            StatusCode::BadShutdown => 0x8002_0000,
            StatusCode::BadConnectionClosed => 0x8002_8000,
            StatusCode::BadNotConnected => 0x8002_C000,
            StatusCode::BadTcpMessageTypeInvalid => 0x807E_0000,
            StatusCode::BadTcpMessageTooLarge => 0x8080_0000,
            StatusCode::BadTcpEndpointUrlInvalid => 0x8080_8000,
            StatusCode::BadProtocolVersionUnsupported => 0x80BE_0000,
            StatusCode::BadSecureChannelIdInvalid => 0x8008_6000,
            StatusCode::BadSecureChannelTokenUnknown => 0x8009_C000,
            StatusCode::BadTcpSecureChannelUnknown => 0x8081_0000,
            StatusCode::BadSequenceNumberInvalid => 0x8009_D000,
            StatusCode::BadSecurityChecksFailed => 0x8013_0000,
            StatusCode::BadCertificateInvalid => 0x8010_0000,
            StatusCode::BadSecurityPolicyRejected => 0x8014_8000,
            StatusCode::BadNonceInvalid => 0x8013_C000,
            StatusCode::BadDecodingError => 0x8007_0000,
            StatusCode::BadEncodingError => 0x8006_C000,
            StatusCode::BadEncodingLimitsExceeded => 0x8007_4000,
            StatusCode::BadRequestTooLarge => 0x80B8_0000,
            StatusCode::BadResponseTooLarge => 0x80B9_0000,
            StatusCode::BadInvalidState => 0x8009_7000,
            StatusCode::BadRequestIdUnknown => 0x8009_E000,
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} (0x{:08X})", self, self.as_u32())
    }
}
