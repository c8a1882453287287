// kafkagate/src/error.rs
//
// Decoder error kinds and their HTTP mapping.
//
// Every failure a decoder or the Kafka sink can produce collapses into one of
// these kinds; listeners translate them into transport responses at egress.

use http::StatusCode;

/// Errors a decoder callback can surface to its listener.
///
/// The order groups server-side Kafka errors, client-side request errors,
/// client-side Kafka errors and HTTP-layer errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum DecoderError {
    /// The producer queue is saturated; the client may retry later.
    #[error("kafka producer queue full")]
    BufferFull,

    /// The request bytes did not parse, or the request itself is disallowed.
    #[error("invalid request")]
    InvalidRequest,

    /// The producer rejected the topic route.
    #[error("unknown topic")]
    UnknownTopic,

    /// The producer rejected the partition route.
    #[error("unknown partition")]
    UnknownPartition,

    /// A single record exceeded the producer message size limit.
    #[error("message too large")]
    MsgTooLarge,

    /// The HTTP method is not accepted by this decoder.
    #[error("method not allowed")]
    MethodNotAllowed,

    /// The URL is outside the served namespace.
    #[error("resource not found")]
    ResourceNotFound,

    /// An allocation or buffer limit failed.
    #[error("out of memory")]
    MemoryError,

    /// Unexpected library failure.
    #[error("generic error")]
    GenericError,
}

impl DecoderError {
    /// Translate a decoder error into the HTTP status sent to the client.
    pub fn http_status(self) -> StatusCode {
        match self {
            DecoderError::BufferFull => StatusCode::SERVICE_UNAVAILABLE,

            // Client side errors
            DecoderError::InvalidRequest
            | DecoderError::UnknownTopic
            | DecoderError::UnknownPartition => StatusCode::BAD_REQUEST,

            DecoderError::MsgTooLarge => StatusCode::PAYLOAD_TOO_LARGE,

            DecoderError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            DecoderError::ResourceNotFound => StatusCode::NOT_FOUND,

            DecoderError::MemoryError | DecoderError::GenericError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
