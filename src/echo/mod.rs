//! UART echo test core
//!
//! Handle discovery and caching, connection setup, subscription control,
//! event correlation, the randomized echo loop, and the session driver that
//! runs them in order and reports pass/fail.

pub mod cache;
pub mod connection;
pub mod correlator;
pub mod discovery;
pub mod engine;
pub mod session;
pub mod subscription;

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::ble::gatt::CharacteristicRole;
use crate::ble::transport::ConnectionHandle;
use crate::ble::BleError;

/// Required GATT items missing from the peripheral.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("UART {role} characteristic not found")]
    MissingCharacteristic { role: CharacteristicRole },

    #[error("CCCD not found on UART {characteristic} characteristic")]
    MissingDescriptor { characteristic: CharacteristicRole },
}

/// GATT operations whose failure aborts a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattOperation {
    Init,
    Connect,
    UpdateParameters,
    DiscoverServices,
    DiscoverDescriptors,
    WriteCccd,
    ArmNotifications,
    DisarmNotifications,
    WriteTx,
    Disconnect,
    Reset,
}

impl fmt::Display for GattOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GattOperation::Init => "radio init",
            GattOperation::Connect => "connect",
            GattOperation::UpdateParameters => "connection parameter update",
            GattOperation::DiscoverServices => "service discovery",
            GattOperation::DiscoverDescriptors => "descriptor discovery",
            GattOperation::WriteCccd => "CCCD write",
            GattOperation::ArmNotifications => "arm notifications",
            GattOperation::DisarmNotifications => "disarm notifications",
            GattOperation::WriteTx => "TX write",
            GattOperation::Disconnect => "disconnect",
            GattOperation::Reset => "reset",
        };
        f.write_str(name)
    }
}

fn fmt_handle(handle: &Option<ConnectionHandle>) -> String {
    match handle {
        Some(h) => format!(" on connection {}", h),
        None => String::new(),
    }
}

/// Everything that can fail an echo session.
#[derive(Error, Debug)]
pub enum EchoError {
    #[error("Discovery failed on connection {connection_handle}: {source}")]
    Discovery {
        connection_handle: ConnectionHandle,
        #[source]
        source: DiscoveryError,
    },

    #[error("{operation} failed{}: {source}", fmt_handle(.connection_handle))]
    Protocol {
        operation: GattOperation,
        connection_handle: Option<ConnectionHandle>,
        #[source]
        source: BleError,
    },

    #[error("Connection parameter update rejected on connection {connection_handle}: {status}")]
    ParameterUpdateRejected {
        connection_handle: ConnectionHandle,
        status: String,
    },

    #[error("Timed out after {after:?} waiting for {waiting_for}{}", fmt_handle(.connection_handle))]
    Timeout {
        waiting_for: &'static str,
        connection_handle: Option<ConnectionHandle>,
        after: Duration,
    },

    #[error("Echo mismatch on connection {connection_handle}: sent {sent}, received {received}")]
    Mismatch {
        connection_handle: ConnectionHandle,
        sent: String,
        received: String,
    },

    #[error("Device event stream closed")]
    EventStreamClosed,

    #[error("Echo loop cancelled")]
    Cancelled,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl EchoError {
    pub(crate) fn protocol(
        operation: GattOperation,
        connection_handle: Option<ConnectionHandle>,
        source: BleError,
    ) -> Self {
        EchoError::Protocol {
            operation,
            connection_handle,
            source,
        }
    }

    /// The connection the failure happened on, when known.
    pub fn connection_handle(&self) -> Option<ConnectionHandle> {
        match self {
            EchoError::Discovery { connection_handle, .. }
            | EchoError::ParameterUpdateRejected { connection_handle, .. }
            | EchoError::Mismatch { connection_handle, .. } => Some(*connection_handle),
            EchoError::Protocol { connection_handle, .. }
            | EchoError::Timeout { connection_handle, .. } => *connection_handle,
            _ => None,
        }
    }

    /// Short classification used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            EchoError::Discovery { .. } => "discovery",
            EchoError::Protocol { .. } | EchoError::ParameterUpdateRejected { .. } => "protocol",
            EchoError::Timeout { .. } => "timeout",
            EchoError::Mismatch { .. } => "mismatch",
            EchoError::EventStreamClosed => "event_stream_closed",
            EchoError::Cancelled => "cancelled",
            EchoError::InvalidArgument(_) => "invalid_argument",
            EchoError::InvalidState(_) => "invalid_state",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_connection_handle() {
        let err = EchoError::protocol(
            GattOperation::WriteTx,
            Some(4),
            BleError::GattError("write rejected".into()),
        );
        assert_eq!(
            err.to_string(),
            "TX write failed on connection 4: GATT error: write rejected"
        );
        assert_eq!(err.connection_handle(), Some(4));

        let err = EchoError::Timeout {
            waiting_for: "RX notification",
            connection_handle: None,
            after: Duration::from_secs(10),
        };
        assert_eq!(err.to_string(), "Timed out after 10s waiting for RX notification");
        assert_eq!(err.kind(), "timeout");
    }

    #[test]
    fn test_discovery_error_display() {
        let err = EchoError::Discovery {
            connection_handle: 0,
            source: DiscoveryError::MissingCharacteristic {
                role: CharacteristicRole::Rx,
            },
        };
        assert_eq!(
            err.to_string(),
            "Discovery failed on connection 0: UART RX characteristic not found"
        );
    }
}
