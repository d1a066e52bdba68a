//! Typed device events
//!
//! The BLE stack under test reports asynchronous activity as JSON records
//! with a `type` string and a loose set of fields, some at the top level and
//! some nested under `value`. This module turns those records into
//! [`DeviceEvent`]s and provides a pump that feeds a line-oriented record
//! stream into the event channel consumed by the correlator.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

use super::transport::ConnectionHandle;

const NOTIFICATION_TYPE: &str = "BLE_HVX_NOTIFICATION";
const PARAMS_UPDATED_TYPE: &str = "on_connection_parameters_update_complete";
const DISCONNECTION_TYPE: &str = "disconnection";

/// Status carried by completion events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Success,
    Failure(String),
}

impl EventStatus {
    fn from_value(value: Option<&Value>) -> Self {
        match value {
            Some(Value::Number(n)) if n.as_u64() == Some(0) => EventStatus::Success,
            Some(Value::String(s)) if s == "BLE_ERROR_NONE" || s == "0" => EventStatus::Success,
            Some(Value::String(s)) => EventStatus::Failure(s.clone()),
            Some(other) => EventStatus::Failure(other.to_string()),
            None => EventStatus::Failure("<missing>".into()),
        }
    }
}

/// An asynchronous event from the device under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceEvent {
    /// Unsolicited value push from the peripheral.
    Notification {
        connection_handle: ConnectionHandle,
        characteristic_handle: u16,
        /// Hex-encoded value.
        data: String,
    },
    ConnectionParametersUpdated {
        connection_handle: ConnectionHandle,
        status: EventStatus,
    },
    Disconnected {
        connection_handle: ConnectionHandle,
    },
    /// Anything the echo core does not act on.
    Other { kind: String },
}

/// Errors turning a raw record into a [`DeviceEvent`].
#[derive(Error, Debug)]
pub enum EventParseError {
    #[error("Malformed event record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{kind} event is missing field '{field}'")]
    MissingField { kind: String, field: &'static str },

    #[error("{kind} event has invalid field '{field}'")]
    InvalidField { kind: String, field: &'static str },
}

#[derive(Deserialize)]
struct RawDeviceEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl RawDeviceEvent {
    /// Look a field up at the top level, then under `value`.
    fn lookup(&self, names: &[&str]) -> Option<&Value> {
        let nested = self.fields.get("value").and_then(Value::as_object);
        names.iter().find_map(|name| {
            self.fields
                .get(*name)
                .or_else(|| nested.and_then(|n| n.get(*name)))
        })
    }

    fn handle(&self, names: &[&str], field: &'static str) -> Result<u16, EventParseError> {
        let value = self.lookup(names).ok_or_else(|| EventParseError::MissingField {
            kind: self.kind.clone(),
            field,
        })?;
        value
            .as_u64()
            .and_then(|v| u16::try_from(v).ok())
            .ok_or_else(|| EventParseError::InvalidField {
                kind: self.kind.clone(),
                field,
            })
    }

    fn connection_handle(&self) -> Result<u16, EventParseError> {
        self.handle(&["connHandle", "connection_handle"], "connection_handle")
    }
}

impl DeviceEvent {
    /// Parse one JSON record.
    pub fn from_json(record: &str) -> Result<Self, EventParseError> {
        let raw: RawDeviceEvent = serde_json::from_str(record)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawDeviceEvent) -> Result<Self, EventParseError> {
        if raw.kind.contains(NOTIFICATION_TYPE) {
            let data = raw
                .lookup(&["data"])
                .ok_or_else(|| EventParseError::MissingField {
                    kind: raw.kind.clone(),
                    field: "data",
                })?
                .as_str()
                .ok_or_else(|| EventParseError::InvalidField {
                    kind: raw.kind.clone(),
                    field: "data",
                })?
                .to_string();
            Ok(DeviceEvent::Notification {
                connection_handle: raw.connection_handle()?,
                characteristic_handle: raw.handle(&["handle"], "handle")?,
                data,
            })
        } else if raw.kind.contains(PARAMS_UPDATED_TYPE) {
            Ok(DeviceEvent::ConnectionParametersUpdated {
                connection_handle: raw.connection_handle()?,
                status: EventStatus::from_value(raw.lookup(&["status"])),
            })
        } else if raw.kind.to_ascii_lowercase().contains(DISCONNECTION_TYPE) {
            Ok(DeviceEvent::Disconnected {
                connection_handle: raw.connection_handle()?,
            })
        } else {
            Ok(DeviceEvent::Other { kind: raw.kind })
        }
    }

    /// Whether this is a notification for `characteristic_handle` on `connection_handle`.
    pub fn is_notification_for(
        &self,
        connection_handle: ConnectionHandle,
        characteristic_handle: u16,
    ) -> bool {
        matches!(
            self,
            DeviceEvent::Notification { connection_handle: c, characteristic_handle: h, .. }
                if *c == connection_handle && *h == characteristic_handle
        )
    }

    /// Short name for logging.
    pub fn kind(&self) -> &str {
        match self {
            DeviceEvent::Notification { .. } => NOTIFICATION_TYPE,
            DeviceEvent::ConnectionParametersUpdated { .. } => PARAMS_UPDATED_TYPE,
            DeviceEvent::Disconnected { .. } => DISCONNECTION_TYPE,
            DeviceEvent::Other { kind } => kind,
        }
    }
}

/// Forward newline-delimited device records into `events`, in order.
///
/// Console chatter before the first `{` on a line is ignored, lines that do
/// not parse are logged and skipped. Returns the number of events forwarded
/// when the reader hits EOF or the receiving side goes away.
pub async fn pump_json_lines<R>(reader: R, events: mpsc::Sender<DeviceEvent>) -> usize
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::warn!("Device event stream read failed: {}", e);
                break;
            }
        };

        let Some(start) = line.find('{') else {
            log::debug!("Ignoring device output: {}", line.trim_end());
            continue;
        };

        match DeviceEvent::from_json(&line[start..]) {
            Ok(event) => {
                if events.send(event).await.is_err() {
                    log::debug!("Event receiver dropped, stopping pump");
                    break;
                }
                forwarded += 1;
            }
            Err(e) => log::warn!("Skipping device event: {}", e),
        }
    }

    forwarded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_record() {
        let event = DeviceEvent::from_json(
            r#"{"type": "BLE_HVX_NOTIFICATION", "connHandle": 0, "handle": 14, "data": "0102030405"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            DeviceEvent::Notification {
                connection_handle: 0,
                characteristic_handle: 14,
                data: "0102030405".into(),
            }
        );
        assert!(event.is_notification_for(0, 14));
        assert!(!event.is_notification_for(1, 14));
        assert!(!event.is_notification_for(0, 17));
    }

    #[test]
    fn test_parameter_update_nested_under_value() {
        let event = DeviceEvent::from_json(
            r#"{"type": "on_connection_parameters_update_complete",
                "value": {"connection_handle": 3, "status": "BLE_ERROR_NONE"}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            DeviceEvent::ConnectionParametersUpdated {
                connection_handle: 3,
                status: EventStatus::Success,
            }
        );

        let rejected = DeviceEvent::from_json(
            r#"{"type": "on_connection_parameters_update_complete", "connection_handle": 3, "status": "BLE_ERROR_INVALID_PARAM"}"#,
        )
        .unwrap();
        match rejected {
            DeviceEvent::ConnectionParametersUpdated { status, .. } => {
                assert_eq!(status, EventStatus::Failure("BLE_ERROR_INVALID_PARAM".into()))
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_numeric_status_zero_is_success() {
        let event = DeviceEvent::from_json(
            r#"{"type": "on_connection_parameters_update_complete", "connHandle": 1, "status": 0}"#,
        )
        .unwrap();
        assert!(matches!(
            event,
            DeviceEvent::ConnectionParametersUpdated { status: EventStatus::Success, .. }
        ));
    }

    #[test]
    fn test_unknown_type_is_other() {
        let event = DeviceEvent::from_json(r#"{"type": "on_data_written", "handle": 3}"#).unwrap();
        assert_eq!(event.kind(), "on_data_written");
    }

    #[test]
    fn test_kind_names_record_type() {
        let notification = DeviceEvent::Notification {
            connection_handle: 0,
            characteristic_handle: 14,
            data: "01".into(),
        };
        assert_eq!(notification.kind(), "BLE_HVX_NOTIFICATION");
        let disconnected = DeviceEvent::Disconnected { connection_handle: 0 };
        assert_eq!(disconnected.kind(), "disconnection");
    }

    #[test]
    fn test_notification_missing_data_is_error() {
        let err = DeviceEvent::from_json(
            r#"{"type": "BLE_HVX_NOTIFICATION", "connHandle": 0, "handle": 14}"#,
        )
        .unwrap_err();
        assert!(matches!(err, EventParseError::MissingField { field: "data", .. }));
    }

    #[test]
    fn test_out_of_range_handle_is_error() {
        let err = DeviceEvent::from_json(
            r#"{"type": "BLE_HVX_NOTIFICATION", "connHandle": 70000, "handle": 14, "data": ""}"#,
        )
        .unwrap_err();
        assert!(matches!(err, EventParseError::InvalidField { field: "connection_handle", .. }));
    }

    #[tokio::test]
    async fn test_pump_forwards_in_order_and_skips_noise() {
        let input = concat!(
            "booting...\n",
            "<<< {\"type\": \"BLE_HVX_NOTIFICATION\", \"connHandle\": 0, \"handle\": 14, \"data\": \"AA\"}\n",
            "{not json}\n",
            "\n",
            "{\"type\": \"on_connection_parameters_update_complete\", \"connHandle\": 0, \"status\": 0}\n",
        );
        let (tx, mut rx) = mpsc::channel(8);

        let forwarded = pump_json_lines(input.as_bytes(), tx).await;
        assert_eq!(forwarded, 2);

        assert!(rx.recv().await.unwrap().is_notification_for(0, 14));
        assert!(matches!(
            rx.recv().await.unwrap(),
            DeviceEvent::ConnectionParametersUpdated { .. }
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_pump_stops_when_receiver_dropped() {
        let input = "{\"type\": \"a\"}\n{\"type\": \"b\"}\n";
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert_eq!(pump_json_lines(input.as_bytes(), tx).await, 0);
    }
}
