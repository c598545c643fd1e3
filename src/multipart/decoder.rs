use super::{CONTENT_TYPE_AUDIO, CONTENT_TYPE_JSON, CRLF};
use crate::directive::Directive;
use crate::error::{AvsError, ProtocolError, Result};
use once_cell::sync::Lazy;
use regex::Regex;

static BOUNDARY_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)boundary\s*=\s*"?([^";\s]+)"?"#).expect("boundary pattern is valid")
});

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Pull the `boundary=` attribute out of a response `Content-Type` header
pub fn extract_boundary(content_type: &str) -> Result<String> {
    BOUNDARY_ATTR
        .captures(content_type)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| ProtocolError::MissingBoundary(content_type.to_string()).into())
}

/// Split a multipart body into directives, in the order they appear.
///
/// A body without any boundary is a valid empty response. Parts that have no
/// header terminator, or whose content type is neither JSON nor octet-stream,
/// are skipped so that one bad part does not hide its siblings.
pub fn decode(body: &[u8], boundary: &str) -> Vec<Directive> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let mut directives = Vec::new();

    let Some(mut cursor) = find(body, &delimiter, 0) else {
        log::debug!("No boundary in {} byte response body", body.len());
        return directives;
    };

    loop {
        let start = cursor + delimiter.len();
        if body[start..].starts_with(b"--") {
            break; // closing delimiter
        }
        let Some(next) = find(body, &delimiter, start) else {
            log::warn!("Multipart body ended without a closing boundary");
            break;
        };

        match decode_part(&body[start..next]) {
            Ok(Some(directive)) => directives.push(directive),
            Ok(None) => {}
            Err(e) => log::warn!("Skipping multipart part: {}", e),
        }
        cursor = next;
    }

    directives
}

fn decode_part(part: &[u8]) -> Result<Option<Directive>> {
    let header_end = find(part, HEADER_END, 0)
        .ok_or_else(|| AvsError::Parse("part has no header terminator".to_string()))?;
    let headers = String::from_utf8_lossy(&part[..header_end]);
    let content = &part[header_end + HEADER_END.len()..];

    let Some(media_type) = content_type_of(&headers) else {
        log::debug!("Skipping part without a Content-Type header");
        return Ok(None);
    };

    match media_type.as_str() {
        CONTENT_TYPE_JSON => {
            let json = strip_crlf(content);
            log::debug!("Directive part: {} bytes of JSON", json.len());
            Ok(Some(Directive::json(json)))
        }
        CONTENT_TYPE_AUDIO => {
            let audio = content.strip_suffix(CRLF).unwrap_or(content);
            log::debug!("Directive part: {} bytes of audio", audio.len());
            Ok(Some(Directive::audio(audio.to_vec())))
        }
        other => {
            log::debug!("Skipping part with content type '{}'", other);
            Ok(None)
        }
    }
}

/// Media type of the part, lowercased and without parameters
fn content_type_of(headers: &str) -> Option<String> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("content-type") {
            return None;
        }
        let media_type = value.split(';').next().unwrap_or_default();
        Some(media_type.trim().to_ascii_lowercase())
    })
}

fn strip_crlf(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i..].starts_with(CRLF) {
            i += CRLF.len();
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    out
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::ContentKind;
    use crate::multipart::{encode_metadata_with_audio, BOUNDARY_TERM};

    #[test]
    fn test_extract_boundary_with_trailing_params() {
        let boundary =
            extract_boundary("multipart/form-data; boundary=Example123;charset=utf-8").unwrap();
        assert_eq!(boundary, "Example123");
    }

    #[test]
    fn test_extract_boundary_at_end_and_quoted() {
        assert_eq!(
            extract_boundary("multipart/related; boundary=------abcdef123456").unwrap(),
            "------abcdef123456"
        );
        assert_eq!(
            extract_boundary("multipart/related; type=\"application/json\"; boundary=\"q-1\"")
                .unwrap(),
            "q-1"
        );
    }

    #[test]
    fn test_extract_boundary_missing() {
        let err = extract_boundary("application/json; charset=utf-8").unwrap_err();
        assert!(matches!(
            err,
            AvsError::Protocol(ProtocolError::MissingBoundary(_))
        ));
        assert!(extract_boundary("multipart/form-data; boundary=").is_err());
    }

    #[test]
    fn test_round_trip() {
        let json = br#"{"event":{"header":{"name":"Recognize"}}}"#;
        let audio: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let body = encode_metadata_with_audio(json, &audio);

        let directives = decode(&body, BOUNDARY_TERM);
        assert_eq!(directives.len(), 2);
        assert_eq!(directives[0].content_kind, ContentKind::Json);
        assert_eq!(directives[0].payload, json.to_vec());
        assert_eq!(directives[1].content_kind, ContentKind::BinaryAudio);
        assert_eq!(directives[1].payload, audio);
    }

    #[test]
    fn test_no_boundary_is_empty() {
        assert!(decode(b"", "abc").is_empty());
        assert!(decode(b"just some text", "abc").is_empty());
    }

    #[test]
    fn test_server_style_response() {
        let body = b"\r\n--xyz\r\n\
            Content-Type: application/json; charset=UTF-8\r\n\r\n\
            {\"directive\":{\"header\":{\"namespace\":\"SpeechSynthesizer\",\"name\":\"Speak\"}}}\r\n\
            --xyz\r\n\
            Content-ID: <abc>\r\n\
            Content-Type: application/octet-stream\r\n\r\n\
            ID3\x00\x01\r\n\
            --xyz--\r\n";

        let directives = decode(body, "xyz");
        assert_eq!(directives.len(), 2);
        assert_eq!(directives[0].content_kind, ContentKind::Json);
        assert!(directives[0].as_str().unwrap().starts_with("{\"directive\""));
        assert_eq!(directives[1].payload, b"ID3\x00\x01".to_vec());
    }

    #[test]
    fn test_json_payload_has_crlf_removed() {
        let body = b"--b\r\nContent-Type: application/json\r\n\r\n{\"a\":\r\n1}\r\n--b--";
        let directives = decode(body, "b");
        assert_eq!(directives.len(), 1);
        assert_eq!(directives[0].payload, b"{\"a\":1}".to_vec());
    }

    #[test]
    fn test_bad_parts_do_not_hide_siblings() {
        let body = b"--b\r\nContent-Type: application/json no terminator\r\n\
            --b\r\nContent-Type: text/plain\r\n\r\nhello\r\n\
            --b\r\nContent-Type: application/json\r\n\r\n{}\r\n\
            --b--\r\n";
        let directives = decode(body, "b");
        assert_eq!(directives.len(), 1);
        assert_eq!(directives[0].payload, b"{}".to_vec());
    }

    #[test]
    fn test_header_name_is_case_insensitive() {
        let body = b"--b\r\ncontent-type: Application/Octet-Stream\r\n\r\nxyz\r\n--b--";
        let directives = decode(body, "b");
        assert_eq!(directives.len(), 1);
        assert_eq!(directives[0].content_kind, ContentKind::BinaryAudio);
    }
}
