//! General transport-layer error, carrying a [`StatusCode`] plus request context.
//!
//! Grounded on `opcua_types::Error` from the teacher codebase: a status-coded,
//! context-carrying error that can be cheaply converted to a bare `StatusCode` at the point
//! a result crosses into a pending request's promise or onto the wire.

use std::{error::Error as StdError, fmt};

use crate::status_code::StatusCode;

/// Result of an encode/decode or transport-level operation.
pub type EncodingResult<T> = std::result::Result<T, Error>;

/// A transport-layer error: a status code plus enough context to log or to route back to a
/// single pending request.
#[derive(Debug)]
pub struct Error {
    status: StatusCode,
    request_id: Option<u32>,
    request_handle: Option<u32>,
    context: Box<dyn StdError + Send + Sync>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.context)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.context)
    }
}

impl Error {
    /// Create a new error with the given status and context.
    pub fn new(status: StatusCode, context: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self {
            status,
            request_id: None,
            request_handle: None,
            context: context.into(),
        }
    }

    /// Shorthand for a `BadDecodingError` with the given context.
    pub fn decoding(context: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::new(StatusCode::BadDecodingError, context)
    }

    /// Shorthand for a `BadEncodingError` with the given context.
    pub fn encoding(context: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::new(StatusCode::BadEncodingError, context)
    }

    /// Attach the request id and request handle this error occurred while processing.
    pub fn with_context(mut self, request_id: Option<u32>, request_handle: Option<u32>) -> Self {
        self.request_id = request_id;
        self.request_handle = request_handle;
        self
    }

    /// The status code carried by this error.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Request id and handle, if both were attached.
    pub fn full_context(&self) -> Option<(u32, u32)> {
        match (self.request_id, self.request_handle) {
            (Some(id), Some(handle)) => Some((id, handle)),
            _ => None,
        }
    }
}

impl From<Error> for StatusCode {
    fn from(value: Error) -> Self {
        log::error!("{value}");
        value.status()
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::decoding(value)
    }
}
