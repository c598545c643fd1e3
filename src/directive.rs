//! Server-issued directives and the few fields the client reads from them.

use crate::error::{ProtocolError, Result};
use chrono::{DateTime, FixedOffset, Utc};
use serde::Deserialize;
use serde_json::Value;
use strum::{AsRefStr, Display};

/// What a directive carries: a JSON command or audio to play
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum ContentKind {
    #[strum(serialize = "application/json")]
    Json,
    #[strum(serialize = "application/octet-stream")]
    BinaryAudio,
}

/// One decoded part of a response or one object from the downchannel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub content_kind: ContentKind,
    pub payload: Vec<u8>,
}

impl Directive {
    pub fn json(payload: Vec<u8>) -> Self {
        Self {
            content_kind: ContentKind::Json,
            payload,
        }
    }

    pub fn audio(payload: Vec<u8>) -> Self {
        Self {
            content_kind: ContentKind::BinaryAudio,
            payload,
        }
    }

    pub fn is_json(&self) -> bool {
        self.content_kind == ContentKind::Json
    }

    pub fn is_audio(&self) -> bool {
        self.content_kind == ContentKind::BinaryAudio
    }

    /// The payload as text, for JSON directives
    pub fn as_str(&self) -> Option<&str> {
        if !self.is_json() {
            return None;
        }
        std::str::from_utf8(&self.payload).ok()
    }

    /// Parse a JSON directive into its header and payload
    pub fn parse(&self) -> Result<ParsedDirective> {
        if !self.is_json() {
            return Err(ProtocolError::MalformedDirective(
                "binary part is not a JSON directive".to_string(),
            )
            .into());
        }
        ParsedDirective::from_slice(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectiveHeader {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub dialog_request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParsedDirective {
    pub header: DirectiveHeader,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Deserialize)]
struct DirectiveWrapper {
    directive: ParsedDirective,
}

impl ParsedDirective {
    /// Parse `{"directive": {"header": ..., "payload": ...}}`
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice::<DirectiveWrapper>(bytes)
            .map(|wrapper| wrapper.directive)
            .map_err(|e| ProtocolError::MalformedDirective(e.to_string()).into())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_slice(json.as_bytes())
    }

    pub fn is(&self, namespace: &str, name: &str) -> bool {
        self.header.namespace == namespace && self.header.name == name
    }

    pub fn token(&self) -> Option<&str> {
        self.payload.get("token").and_then(Value::as_str)
    }

    /// Token of a `SpeechSynthesizer.Speak` directive
    pub fn speak_token(&self) -> Option<&str> {
        if self.header.name == "Speak" {
            self.token()
        } else {
            None
        }
    }

    /// Token and due time of an `Alerts.SetAlert` directive
    pub fn alert_schedule(&self) -> Option<(String, DateTime<Utc>)> {
        if self.header.name != "SetAlert" {
            return None;
        }
        let token = self.token()?.to_string();
        let scheduled = self.payload.get("scheduledTime").and_then(Value::as_str)?;
        match parse_scheduled_time(scheduled) {
            Some(due) => Some((token, due)),
            None => {
                log::warn!("⏰ Unparseable alert time '{}'", scheduled);
                None
            }
        }
    }

    /// Token of an `Alerts.DeleteAlert` directive
    pub fn deleted_alert(&self) -> Option<&str> {
        if self.header.name == "DeleteAlert" {
            self.token()
        } else {
            None
        }
    }
}

/// ISO 8601 times as sent by AVS, with or without a colon in the offset
pub fn parse_scheduled_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::<FixedOffset>::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z"))
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_content_kind_mime_names() {
        assert_eq!(ContentKind::Json.as_ref(), "application/json");
        assert_eq!(ContentKind::BinaryAudio.to_string(), "application/octet-stream");
    }

    #[test]
    fn test_parse_speak() {
        let directive = Directive::json(
            br#"{"directive":{"header":{"namespace":"SpeechSynthesizer","name":"Speak","messageId":"m1","dialogRequestId":"d1"},"payload":{"url":"cid:1","format":"AUDIO_MPEG","token":"amzn1.as-ct.v1.abc"}}}"#.to_vec(),
        );
        let parsed = directive.parse().unwrap();
        assert!(parsed.is("SpeechSynthesizer", "Speak"));
        assert_eq!(parsed.header.dialog_request_id.as_deref(), Some("d1"));
        assert_eq!(parsed.speak_token(), Some("amzn1.as-ct.v1.abc"));
        assert_eq!(parsed.alert_schedule(), None);
    }

    #[test]
    fn test_parse_stop_capture_without_payload() {
        let parsed =
            ParsedDirective::from_json(r#"{"directive":{"header":{"namespace":"SpeechRecognizer","name":"StopCapture"}}}"#)
                .unwrap();
        assert_eq!(parsed.header.name, "StopCapture");
        assert_eq!(parsed.payload, Value::Null);
        assert_eq!(parsed.speak_token(), None);
    }

    #[test]
    fn test_malformed_directive() {
        assert!(ParsedDirective::from_json("{\"directive\":").is_err());
        assert!(ParsedDirective::from_json("{\"other\":{}}").is_err());
        assert!(Directive::audio(vec![1, 2, 3]).parse().is_err());
    }

    #[test]
    fn test_alert_schedule() {
        let parsed = ParsedDirective::from_json(
            r#"{"directive":{"header":{"namespace":"Alerts","name":"SetAlert"},"payload":{"token":"t-1","type":"TIMER","scheduledTime":"2017-02-20T09:00:00+0000"}}}"#,
        )
        .unwrap();
        let (token, due) = parsed.alert_schedule().unwrap();
        assert_eq!(token, "t-1");
        assert_eq!(due, Utc.with_ymd_and_hms(2017, 2, 20, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_scheduled_time_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        assert_eq!(parse_scheduled_time("2024-05-01T12:30:00Z"), Some(expected));
        assert_eq!(parse_scheduled_time("2024-05-01T14:30:00+02:00"), Some(expected));
        assert_eq!(parse_scheduled_time("2024-05-01T14:30:00+0200"), Some(expected));
        assert_eq!(parse_scheduled_time("tomorrow"), None);
    }
}
