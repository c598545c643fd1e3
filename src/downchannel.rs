//! The long-lived `GET /directives` stream.
//!
//! AVS pushes directives on this connection at arbitrary times. Reads can
//! split a JSON object anywhere, or carry several objects at once, so the
//! bytes go through a [`JsonObjectScanner`] that only emits an object once
//! its closing brace has arrived.

use crate::config::AvsConfig;
use crate::error::{AvsError, ProtocolError};
use futures_util::StreamExt;
use reqwest::Client;
use std::time::Duration;
use strum::Display;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Largest directive we are willing to buffer before giving up on it
const MAX_OBJECT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

impl ConnectionState {
    /// Connecting or open
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Open)
    }
}

/// Incremental extractor of top-level JSON objects from a byte stream.
///
/// Tracks brace depth, string literals and escapes across calls to
/// [`push`](Self::push). Bytes between objects (multipart delimiters,
/// whitespace) are discarded.
#[derive(Debug, Default)]
pub struct JsonObjectScanner {
    buffer: Vec<u8>,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl JsonObjectScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every object completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut complete = Vec::new();

        for &byte in chunk {
            if self.depth == 0 {
                if byte == b'{' {
                    self.buffer.clear();
                    self.buffer.push(byte);
                    self.depth = 1;
                }
                continue;
            }

            self.buffer.push(byte);

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => self.in_string = true,
                b'{' => self.depth += 1,
                b'}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        complete.push(std::mem::take(&mut self.buffer));
                    }
                }
                _ => {}
            }
        }

        if self.buffer.len() > MAX_OBJECT_BYTES {
            log::warn!(
                "Dropping {} byte partial directive, exceeds limit",
                self.buffer.len()
            );
            self.reset();
        }

        complete
    }

    /// Bytes held for an object that has not closed yet
    pub fn pending(&self) -> usize {
        if self.depth == 0 {
            0
        } else {
            self.buffer.len()
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// What the stream reports while it runs
#[derive(Debug)]
pub enum DownchannelEvent {
    Connecting,
    Open,
    Directive(String),
    /// Terminal. `None` for a clean close by the server or by teardown.
    Closed(Option<AvsError>),
}

pub struct DownchannelStream {
    http: Client,
    url: String,
    timeout: Duration,
    token: String,
    state: watch::Sender<ConnectionState>,
}

impl DownchannelStream {
    pub fn new(http: Client, config: &AvsConfig, token: String) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            http,
            url: config.directives_url(),
            timeout: config.downchannel_timeout,
            token,
            state,
        }
    }

    /// Live view of the connection state
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Hold the connection open until the server closes it, an error occurs or
    /// `cancel` fires. Every state change and directive goes to `on_event`,
    /// ending with exactly one `Closed`.
    pub async fn run<F>(self, cancel: CancellationToken, mut on_event: F)
    where
        F: FnMut(DownchannelEvent) + Send,
    {
        self.state.send_replace(ConnectionState::Connecting);
        on_event(DownchannelEvent::Connecting);
        log::info!("📡 Opening downchannel to {}", self.url);

        let request = self
            .http
            .get(&self.url)
            .bearer_auth(&self.token)
            .timeout(self.timeout)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("📡 Downchannel cancelled while connecting");
                return self.close(None, &mut on_event);
            }
            response = request => response,
        };

        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                let status = response.status().as_u16();
                log::error!("📡 Downchannel handshake failed with status {}", status);
                return self.close(
                    Some(ProtocolError::UnexpectedStatus(status).into()),
                    &mut on_event,
                );
            }
            Err(e) => {
                log::error!("📡 Downchannel connection failed: {}", e);
                return self.close(Some(e.into()), &mut on_event);
            }
        };

        self.state.send_replace(ConnectionState::Open);
        on_event(DownchannelEvent::Open);
        log::info!("📡 Downchannel open");

        let mut body = response.bytes_stream();
        let mut scanner = JsonObjectScanner::new();
        let mut error = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("📡 Downchannel torn down");
                    break;
                }
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        log::debug!("📡 Downchannel received {} bytes", bytes.len());
                        for object in scanner.push(&bytes) {
                            match String::from_utf8(object) {
                                Ok(json) => on_event(DownchannelEvent::Directive(json)),
                                Err(e) => log::warn!("📡 Dropping non-UTF-8 directive: {}", e),
                            }
                        }
                    }
                    Some(Err(e)) => {
                        log::error!("📡 Downchannel read failed: {}", e);
                        error = Some(e.into());
                        break;
                    }
                    None => {
                        log::info!("📡 Downchannel closed by server");
                        break;
                    }
                },
            }
        }

        if scanner.pending() > 0 {
            log::warn!(
                "📡 Discarding {} bytes of an incomplete directive",
                scanner.pending()
            );
        }
        self.close(error, &mut on_event);
    }

    fn close<F>(&self, error: Option<AvsError>, on_event: &mut F)
    where
        F: FnMut(DownchannelEvent),
    {
        self.state.send_replace(ConnectionState::Closed);
        on_event(DownchannelEvent::Closed(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STOP_CAPTURE: &str = r#"{"directive":{"header":{"name":"StopCapture"}}}"#;

    #[test]
    fn test_split_object_is_emitted_once_complete() {
        let bytes = STOP_CAPTURE.as_bytes();
        for first in 1..bytes.len() - 1 {
            for second in first + 1..bytes.len() {
                let mut scanner = JsonObjectScanner::new();
                assert!(scanner.push(&bytes[..first]).is_empty());
                assert!(scanner.push(&bytes[first..second]).is_empty());
                let objects = scanner.push(&bytes[second..]);
                assert_eq!(objects, vec![bytes.to_vec()], "split at {first}/{second}");
            }
        }
    }

    #[test]
    fn test_prefix_alone_emits_nothing() {
        let mut scanner = JsonObjectScanner::new();
        assert!(scanner.push(&STOP_CAPTURE.as_bytes()[..20]).is_empty());
        assert_eq!(scanner.pending(), 20);
    }

    #[test]
    fn test_multiple_objects_in_one_chunk() {
        let mut scanner = JsonObjectScanner::new();
        let chunk = format!(
            "--boundary\r\nContent-Type: application/json\r\n\r\n{}\r\n--boundary\r\n\r\n{{\"b\":2}}",
            STOP_CAPTURE
        );
        let objects = scanner.push(chunk.as_bytes());
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0], STOP_CAPTURE.as_bytes());
        assert_eq!(objects[1], b"{\"b\":2}");
        assert_eq!(scanner.pending(), 0);
    }

    #[test]
    fn test_braces_inside_strings_are_ignored() {
        let mut scanner = JsonObjectScanner::new();
        let tricky = r#"{"text":"a } and { and \" } quote","n":{"x":"\\"}}"#;
        assert!(scanner.push(&tricky.as_bytes()[..15]).is_empty());
        let objects = scanner.push(&tricky.as_bytes()[15..]);
        assert_eq!(objects, vec![tricky.as_bytes().to_vec()]);
        serde_json::from_slice::<serde_json::Value>(&objects[0]).unwrap();
    }

    #[test]
    fn test_escape_split_across_chunks() {
        let mut scanner = JsonObjectScanner::new();
        assert!(scanner.push(br#"{"a":"x\"#).is_empty());
        assert!(scanner.push(br#""}"#).is_empty());
        assert_eq!(scanner.push(br#""}"#), vec![br#"{"a":"x\"}"}"#.to_vec()]);
    }

    #[test]
    fn test_oversized_object_is_dropped() {
        let mut scanner = JsonObjectScanner::new();
        let mut chunk = b"{\"a\":\"".to_vec();
        chunk.extend(std::iter::repeat(b'x').take(MAX_OBJECT_BYTES + 1));
        assert!(scanner.push(&chunk).is_empty());
        assert_eq!(scanner.pending(), 0);
        assert_eq!(scanner.push(b"{}"), vec![b"{}".to_vec()]);
    }

    #[test]
    fn test_connection_state_activity() {
        assert!(!ConnectionState::Idle.is_active());
        assert!(ConnectionState::Connecting.is_active());
        assert!(ConnectionState::Open.is_active());
        assert!(!ConnectionState::Closed.is_active());
        assert_eq!(ConnectionState::Open.to_string(), "Open");
    }
}
