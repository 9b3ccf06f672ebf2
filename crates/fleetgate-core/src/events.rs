//! Wire models reported by devices and the status mapping that feeds the
//! rollout log.
//!
//! Field order matters: stored event lines are the serializer's canonical
//! form, and operator tooling diffs them byte-for-byte across uploads.

use serde::{Deserialize, Serialize};

/// One update event as devices report it to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceUpdateEvent {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "deviceTime", default)]
    pub device_time: String,
    pub event: DeviceEvent,
    #[serde(rename = "eventType")]
    pub event_type: DeviceEventType,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceEvent {
    #[serde(rename = "correlationId", default)]
    pub correlation_id: String,
    #[serde(default)]
    pub ecu: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(rename = "targetName", default)]
    pub target_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceEventType {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub version: i32,
}

/// Apps state snapshot body. Only `deviceTime` is validated; the apps tree
/// passes through opaquely so newer device agents can report richer state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppsStates {
    #[serde(rename = "deviceTime")]
    pub device_time: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ostree: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub apps: serde_json::Value,
}

/// `PUT /system_info/network` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_ipv4: Option<String>,
}

/// One line of `logs/rollouts.log`, consumed by the SSE tailers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceStatus {
    pub uuid: String,
    #[serde(rename = "correlationId")]
    pub correlation_id: String,
    #[serde(rename = "target-name")]
    pub target_name: String,
    pub status: String,
}

/// Maps an event to the human-readable status shown in rollout feeds.
/// Events with ids outside the table produce no status line. A missing
/// `success` flag counts as success (started/applied events never carry
/// one).
#[must_use]
pub fn parse_status(event: &DeviceUpdateEvent) -> Option<&'static str> {
    let success = event.event.success.unwrap_or(true);
    match (event.event_type.id.as_str(), success) {
        ("MetadataUpdateCompleted", true) => Some("Metadata update completed"),
        ("MetadataUpdateCompleted", false) => Some("Metadata update failed"),
        ("EcuDownloadStarted", true) => Some("Download started"),
        ("EcuDownloadCompleted", true) => Some("Download completed"),
        ("EcuDownloadCompleted", false) => Some("Download failed"),
        ("EcuInstallationStarted", true) => Some("Install started"),
        ("EcuInstallationApplied", true) => {
            Some("Install applied, awaiting update finalization")
        }
        ("EcuInstallationCompleted", true) => Some("Install completed"),
        ("EcuInstallationCompleted", false) => Some("Install failed"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(type_id: &str, success: Option<bool>) -> DeviceUpdateEvent {
        DeviceUpdateEvent {
            id: "1_c1".into(),
            device_time: "2023-12-12T12:00:00Z".into(),
            event: DeviceEvent {
                correlation_id: "c1".into(),
                success,
                target_name: "target".into(),
                version: "1".into(),
                ..DeviceEvent::default()
            },
            event_type: DeviceEventType {
                id: type_id.into(),
                version: 0,
            },
        }
    }

    #[test]
    fn serialized_field_order_is_stable() {
        let line = serde_json::to_string(&event("EcuDownloadStarted", None)).unwrap();
        assert_eq!(
            line,
            r#"{"id":"1_c1","deviceTime":"2023-12-12T12:00:00Z","event":{"correlationId":"c1","ecu":"","targetName":"target","version":"1"},"eventType":{"id":"EcuDownloadStarted","version":0}}"#
        );
    }

    #[test]
    fn success_flag_serializes_between_ecu_and_target() {
        let line = serde_json::to_string(&event("EcuDownloadCompleted", Some(false))).unwrap();
        assert!(line.contains(r#""ecu":"","success":false,"targetName":"#));
    }

    #[test]
    fn round_trip_preserves_event() {
        let original = event("EcuInstallationCompleted", Some(true));
        let line = serde_json::to_string(&original).unwrap();
        let parsed: DeviceUpdateEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn status_mapping_table() {
        let cases = [
            ("MetadataUpdateCompleted", None, Some("Metadata update completed")),
            ("MetadataUpdateCompleted", Some(false), Some("Metadata update failed")),
            ("EcuDownloadStarted", None, Some("Download started")),
            ("EcuDownloadCompleted", Some(true), Some("Download completed")),
            ("EcuDownloadCompleted", Some(false), Some("Download failed")),
            ("EcuInstallationStarted", None, Some("Install started")),
            (
                "EcuInstallationApplied",
                None,
                Some("Install applied, awaiting update finalization"),
            ),
            ("EcuInstallationCompleted", None, Some("Install completed")),
            ("EcuInstallationCompleted", Some(false), Some("Install failed")),
            ("DevicePaused", None, None),
            ("EcuDownloadStarted", Some(false), None),
        ];
        for (id, success, expected) in cases {
            assert_eq!(parse_status(&event(id, success)), expected, "case {id}");
        }
    }

    #[test]
    fn network_info_rejects_non_string_fields() {
        assert!(serde_json::from_str::<NetworkInfo>(r#"{"hostname":"h"}"#).is_ok());
        assert!(serde_json::from_str::<NetworkInfo>(r#"{"hostname":123}"#).is_err());
    }
}
