//! GATT client trait definitions and core types
//!
//! Defines the narrow interface the echo core needs from a BLE central:
//! radio init, connect, connection parameter requests, discovery, writes
//! and notification arming. Both the simulated peripheral and real stack
//! adapters conform to it.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::gatt::{DescriptorHandle, DiscoveredService};
use super::BleError;

/// A 6-byte BLE MAC address, most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress(pub [u8; 6]);

impl FromStr for PeerAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 6 {
            return Err(format!("expected 6 octets in MAC address '{}'", s));
        }
        let mut bytes = [0u8; 6];
        for (byte, part) in bytes.iter_mut().zip(parts) {
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(format!("malformed octet '{}' in MAC address '{}'", part, s));
            }
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| format!("malformed octet '{}' in MAC address '{}'", part, s))?;
        }
        Ok(PeerAddress(bytes))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Peer address type, as coded by the test harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressType {
    Public,
    Random,
    PublicIdentity,
    RandomStaticIdentity,
    Anonymous,
}

impl AddressType {
    /// Map a harness address-type code to its type.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(AddressType::Public),
            1 => Some(AddressType::Random),
            2 => Some(AddressType::PublicIdentity),
            3 => Some(AddressType::RandomStaticIdentity),
            0xFF => Some(AddressType::Anonymous),
            _ => None,
        }
    }

    /// The name the BLE stack expects on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressType::Public => "PUBLIC",
            AddressType::Random => "RANDOM",
            AddressType::PublicIdentity => "PUBLIC_IDENTITY",
            AddressType::RandomStaticIdentity => "RANDOM_STATIC_IDENTITY",
            AddressType::Anonymous => "ANONYMOUS",
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stack-assigned connection handle.
pub type ConnectionHandle = u16;

/// An established connection. Owned by exactly one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub connection_handle: ConnectionHandle,
    pub peer_address: PeerAddress,
    pub address_type: AddressType,
}

/// Connection parameter update request, in the stack's native units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParameters {
    /// Minimum connection interval, 1.25 ms units.
    pub interval_min: u16,
    /// Maximum connection interval, 1.25 ms units.
    pub interval_max: u16,
    pub peripheral_latency: u16,
    /// Supervision timeout, 10 ms units.
    pub supervision_timeout: u16,
}

impl Default for ConnectionParameters {
    /// 7.5-30 ms interval, latency 5, 2.5 s supervision timeout.
    fn default() -> Self {
        Self {
            interval_min: 6,
            interval_max: 24,
            peripheral_latency: 5,
            supervision_timeout: 250,
        }
    }
}

impl ConnectionParameters {
    pub fn interval_min_ms(&self) -> f32 {
        self.interval_min as f32 * 1.25
    }

    pub fn interval_max_ms(&self) -> f32 {
        self.interval_max as f32 * 1.25
    }

    pub fn supervision_timeout_ms(&self) -> u32 {
        self.supervision_timeout as u32 * 10
    }
}

/// BLE central role as seen by the echo core.
///
/// Asynchronous results (notifications, parameter update completion) are
/// not returned here; the stack delivers them on its device event stream.
#[async_trait]
pub trait GattClient: Send + Sync {
    /// Initialize the radio stack.
    async fn init(&self) -> Result<(), BleError>;

    /// Open a connection to a peripheral.
    async fn connect(
        &self,
        address: &PeerAddress,
        address_type: AddressType,
    ) -> Result<ConnectionInfo, BleError>;

    /// Request new connection parameters. Completion arrives as an event.
    async fn update_connection_parameters(
        &self,
        connection: ConnectionHandle,
        params: &ConnectionParameters,
    ) -> Result<(), BleError>;

    /// Enumerate all primary services and their characteristics.
    async fn discover_services(
        &self,
        connection: ConnectionHandle,
    ) -> Result<Vec<DiscoveredService>, BleError>;

    /// Enumerate descriptors in an attribute handle range.
    async fn discover_descriptors(
        &self,
        connection: ConnectionHandle,
        start_handle: u16,
        end_handle: u16,
    ) -> Result<Vec<DescriptorHandle>, BleError>;

    /// Write a descriptor value given as a hex string.
    async fn write_descriptor(
        &self,
        connection: ConnectionHandle,
        handle: u16,
        value_hex: &str,
    ) -> Result<(), BleError>;

    /// Arm or disarm delivery of unsolicited notifications to the event stream.
    async fn set_unsolicited_hvx(&self, enabled: bool) -> Result<(), BleError>;

    /// Unacknowledged write of a hex-encoded value.
    async fn write_without_response(
        &self,
        connection: ConnectionHandle,
        handle: u16,
        data_hex: &str,
    ) -> Result<(), BleError>;

    /// Close the connection.
    async fn disconnect(&self, connection: ConnectionHandle) -> Result<(), BleError>;

    /// Return the stack to its post-init state so the board can be reused.
    async fn reset(&self) -> Result<(), BleError>;
}
