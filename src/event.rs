//! Client-to-server event documents.
//!
//! Every envelope gets a fresh `messageId` (and `dialogRequestId` for
//! recognize requests) at construction time, since the server tracks
//! exchanges by these ids.

use crate::error::Result;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventHeader {
    pub namespace: String,
    pub name: String,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dialog_request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub header: EventHeader,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextHeader {
    pub namespace: String,
    pub name: String,
}

/// One entry of the device state snapshot attached to an event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextEntry {
    pub header: ContextHeader,
    pub payload: Value,
}

impl ContextEntry {
    fn new(namespace: &str, name: &str, payload: Value) -> Self {
        Self {
            header: ContextHeader {
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope {
    pub event: Event,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<ContextEntry>>,
}

impl EventEnvelope {
    /// A bare event with a fresh message id
    pub fn new(namespace: &str, name: &str, payload: Value) -> Self {
        Self {
            event: Event {
                header: EventHeader {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    message_id: Uuid::new_v4().to_string(),
                    dialog_request_id: None,
                },
                payload,
            },
            context: None,
        }
    }

    /// `System.SynchronizeState`, sent once the downchannel is up
    pub fn synchronize_state() -> Self {
        Self::new("System", "SynchronizeState", json!({}))
            .with_context(device_context("IDLE", 50))
    }

    /// `SpeechRecognizer.Recognize` for 16 kHz mono PCM audio
    pub fn recognize() -> Self {
        let mut envelope = Self::new(
            "SpeechRecognizer",
            "Recognize",
            json!({
                "profile": "NEAR_FIELD",
                "format": "AUDIO_L16_RATE_16000_CHANNELS_1"
            }),
        )
        .with_context(device_context("FINISHED", 25));
        envelope.event.header.dialog_request_id = Some(Uuid::new_v4().to_string());
        envelope
    }

    /// Minimal notification carrying only a token, e.g. `SpeechStarted`
    pub fn with_token(namespace: &str, name: &str, token: &str) -> Self {
        Self::new(namespace, name, json!({ "token": token }))
    }

    pub fn with_context(mut self, context: Vec<ContextEntry>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.event.header.namespace
    }

    pub fn name(&self) -> &str {
        &self.event.header.name
    }

    pub fn message_id(&self) -> &str {
        &self.event.header.message_id
    }

    pub fn dialog_request_id(&self) -> Option<&str> {
        self.event.header.dialog_request_id.as_deref()
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Fixed snapshot of player, speech, alert and speaker state
pub fn device_context(player_activity: &str, volume: u8) -> Vec<ContextEntry> {
    vec![
        ContextEntry::new(
            "AudioPlayer",
            "PlaybackState",
            json!({ "token": "", "offsetInMilliseconds": 0, "playerActivity": player_activity }),
        ),
        ContextEntry::new(
            "SpeechSynthesizer",
            "SpeechState",
            json!({ "token": "", "offsetInMilliseconds": 0, "playerActivity": "FINISHED" }),
        ),
        ContextEntry::new(
            "Alerts",
            "AlertsState",
            json!({ "allAlerts": [], "activeAlerts": [] }),
        ),
        ContextEntry::new(
            "Speaker",
            "VolumeState",
            json!({ "volume": volume, "muted": false }),
        ),
    ]
}
