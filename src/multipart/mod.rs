//! Multipart MIME framing for the events endpoint.
//!
//! Requests are built with a fixed boundary term. Responses carry their own
//! boundary in the `Content-Type` header, which the decoder extracts first.

pub mod decoder;
pub mod encoder;

pub use decoder::{decode, extract_boundary};
pub use encoder::{encode, encode_metadata, encode_metadata_with_audio, request_content_type, Part};

/// Boundary used for every request body. Must never occur inside a payload.
pub const BOUNDARY_TERM: &str = "CUSTOM_BOUNDARY_TERM";

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_AUDIO: &str = "application/octet-stream";

pub(crate) const CRLF: &[u8] = b"\r\n";
