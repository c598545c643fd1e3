use super::{BOUNDARY_TERM, CONTENT_TYPE_AUDIO, CRLF};

/// One named section of a multipart request body
#[derive(Debug, Clone)]
pub struct Part<'a> {
    pub name: &'a str,
    pub content_type: &'a str,
    pub bytes: &'a [u8],
}

impl<'a> Part<'a> {
    pub fn metadata(json: &'a [u8]) -> Self {
        Self {
            name: "metadata",
            content_type: "application/json; charset=UTF-8",
            bytes: json,
        }
    }

    pub fn audio(pcm: &'a [u8]) -> Self {
        Self {
            name: "audio",
            content_type: CONTENT_TYPE_AUDIO,
            bytes: pcm,
        }
    }
}

/// Value for the request `Content-Type` header
pub fn request_content_type() -> String {
    format!("multipart/form-data; boundary={}", BOUNDARY_TERM)
}

/// Serialize the parts, in order, into a single body terminated by the closing boundary
pub fn encode(parts: &[Part<'_>]) -> Vec<u8> {
    let capacity = parts.iter().map(|p| p.bytes.len() + 128).sum::<usize>() + 64;
    let mut body = Vec::with_capacity(capacity);

    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY_TERM).as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{}\"\r\n", part.name).as_bytes(),
        );
        body.extend_from_slice(format!("Content-Type: {}\r\n", part.content_type).as_bytes());
        body.extend_from_slice(CRLF);
        body.extend_from_slice(part.bytes);
        body.extend_from_slice(CRLF);
    }

    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY_TERM).as_bytes());
    body
}

/// Body for sync and plain events
pub fn encode_metadata(json: &[u8]) -> Vec<u8> {
    encode(&[Part::metadata(json)])
}

/// Body for recognize requests: metadata first, then the recorded audio
pub fn encode_metadata_with_audio(json: &[u8], audio: &[u8]) -> Vec<u8> {
    encode(&[Part::metadata(json), Part::audio(audio)])
}
