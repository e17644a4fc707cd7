//! Typed unsolicited server events.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::transport::Notification;

/// A scanned token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenInfo {
    /// Token type, e.g. `"ntag"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Tag UID.
    pub uid: String,
    /// Text stored on the tag.
    pub text: String,
    /// Raw tag data, hex encoded.
    pub data: String,
    /// When the token was scanned (RFC 3339).
    pub scan_time: String,
}

/// Media currently playing on the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayingMedia {
    /// System id, e.g. `"SNES"`.
    pub system_id: String,
    /// Display name of the system.
    pub system_name: String,
    /// Path of the launched media.
    pub media_path: String,
    /// Display name of the launched media.
    pub media_name: String,
}

/// Media database indexing progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexingStatus {
    /// Whether a media database exists.
    pub exists: bool,
    /// Whether indexing is running.
    pub indexing: bool,
    /// Total indexing steps.
    pub total_steps: Option<u32>,
    /// Current step.
    pub current_step: Option<u32>,
    /// Label for the current step.
    pub current_step_display: Option<String>,
    /// Files indexed so far.
    pub total_files: Option<u64>,
}

/// A token reader attached to the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReaderInfo {
    /// Reader driver name.
    pub driver: String,
    /// Device path the reader is attached on.
    pub path: String,
    /// Whether the reader is connected.
    pub connected: bool,
}

/// Unsolicited update pushed by Zaparoo Core.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A token was placed on a reader.
    TokenAdded(TokenInfo),
    /// The active token was removed.
    TokenRemoved,
    /// Media started playing.
    MediaStarted(PlayingMedia),
    /// Playback stopped.
    MediaStopped,
    /// Indexing progress changed.
    Indexing(IndexingStatus),
    /// A reader was attached.
    ReaderAdded(ReaderInfo),
    /// A reader was detached.
    ReaderRemoved(ReaderInfo),
    /// Anything else.
    Unknown(String),
}

impl ServerEvent {
    /// Translate a notification. Unrecognized methods and payloads that do
    /// not fit their method map to [`ServerEvent::Unknown`].
    pub fn from_notification(notification: &Notification) -> Self {
        let params = notification.params.clone().unwrap_or(Value::Null);
        let parsed = match notification.method.as_str() {
            "tokens.added" => payload(params).map(Self::TokenAdded),
            "tokens.removed" => Ok(Self::TokenRemoved),
            "media.started" => payload(params).map(Self::MediaStarted),
            "media.stopped" => Ok(Self::MediaStopped),
            "media.indexing" => payload(params).map(Self::Indexing),
            "readers.added" => payload(params).map(Self::ReaderAdded),
            "readers.removed" => payload(params).map(Self::ReaderRemoved),
            _ => return Self::Unknown(notification.method.clone()),
        };
        parsed.unwrap_or_else(|e| {
            warn!(method = %notification.method, error = %e, "unexpected notification payload");
            Self::Unknown(notification.method.clone())
        })
    }
}

fn payload<T: for<'de> Deserialize<'de> + Default>(params: Value) -> Result<T, serde_json::Error> {
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notification(method: &str, params: Value) -> Notification {
        Notification {
            method: method.into(),
            params: Some(params),
        }
    }

    #[test]
    fn test_token_added() {
        let event = ServerEvent::from_notification(&notification(
            "tokens.added",
            json!({
                "type": "ntag",
                "uid": "04a1b2c3",
                "text": "**launch.random:snes",
                "data": "",
                "scanTime": "2024-05-01T10:00:00Z"
            }),
        ));
        let ServerEvent::TokenAdded(token) = event else {
            panic!("expected token");
        };
        assert_eq!(token.kind, "ntag");
        assert_eq!(token.uid, "04a1b2c3");
        assert_eq!(token.scan_time, "2024-05-01T10:00:00Z");
    }

    #[test]
    fn test_media_and_indexing() {
        let event = ServerEvent::from_notification(&notification(
            "media.started",
            json!({"systemId": "SNES", "systemName": "Super Nintendo", "mediaPath": "/roms/a.sfc", "mediaName": "A"}),
        ));
        assert!(matches!(event, ServerEvent::MediaStarted(ref m) if m.system_id == "SNES"));

        let event = ServerEvent::from_notification(&Notification {
            method: "media.stopped".into(),
            params: None,
        });
        assert_eq!(event, ServerEvent::MediaStopped);

        let event = ServerEvent::from_notification(&notification(
            "media.indexing",
            json!({"exists": true, "indexing": true, "totalSteps": 10, "currentStep": 3}),
        ));
        let ServerEvent::Indexing(status) = event else {
            panic!("expected indexing");
        };
        assert_eq!(status.current_step, Some(3));
        assert_eq!(status.total_files, None);
    }

    #[test]
    fn test_unknown_and_bad_payloads() {
        let event = ServerEvent::from_notification(&notification("systems.updated", json!({})));
        assert_eq!(event, ServerEvent::Unknown("systems.updated".into()));

        let event = ServerEvent::from_notification(&notification("tokens.added", json!([1, 2])));
        assert_eq!(event, ServerEvent::Unknown("tokens.added".into()));
    }
}
