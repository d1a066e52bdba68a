//! GATT identifiers and handle records for the UART service
//!
//! Defines the UART service and characteristic UUIDs, the attribute UUID
//! representation reported by the BLE stack (which may be a compacted
//! integer or a 128-bit string), and the handle records produced by
//! discovery.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// UART service UUID.
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

/// UART TX characteristic UUID. The client writes here.
pub const UART_TX_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

/// UART RX characteristic UUID. The peripheral notifies here.
pub const UART_RX_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

/// Client Characteristic Configuration Descriptor (16-bit form).
pub const CCCD_UUID: u16 = 0x2902;

/// Low 96 bits of the Bluetooth base UUID `00000000-0000-1000-8000-00805F9B34FB`.
const BLUETOOTH_BASE_LOW: u128 = 0x0000_1000_8000_0080_5F9B_34FB;
const BLUETOOTH_BASE_MASK: u128 = (1u128 << 96) - 1;

/// An attribute UUID as reported by the BLE stack.
///
/// Short UUIDs arrive as plain integers, vendor UUIDs as 128-bit strings.
/// Anything else is kept verbatim so callers can decide to skip it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttUuid {
    Short(u32),
    Long(Uuid),
    Other(String),
}

impl AttUuid {
    /// Expand to the full 128-bit form, if this UUID has one.
    pub fn to_uuid(&self) -> Option<Uuid> {
        match self {
            AttUuid::Short(short) => Some(Uuid::from_u128(
                ((*short as u128) << 96) | BLUETOOTH_BASE_LOW,
            )),
            AttUuid::Long(uuid) => Some(*uuid),
            AttUuid::Other(raw) => Uuid::parse_str(raw.trim()).ok(),
        }
    }

    /// The compacted 16/32-bit value, if this UUID lies on the Bluetooth base.
    ///
    /// `Other` strings never compact: they are the representation the
    /// descriptor scan skips instead of comparing.
    pub fn as_short(&self) -> Option<u32> {
        match self {
            AttUuid::Short(short) => Some(*short),
            AttUuid::Long(uuid) => {
                let value = uuid.as_u128();
                (value & BLUETOOTH_BASE_MASK == BLUETOOTH_BASE_LOW).then(|| (value >> 96) as u32)
            }
            AttUuid::Other(_) => None,
        }
    }

    /// Whether this UUID identifies `target`, whatever form it arrived in.
    pub fn matches(&self, target: &Uuid) -> bool {
        self.to_uuid().as_ref() == Some(target)
    }
}

impl From<Uuid> for AttUuid {
    fn from(uuid: Uuid) -> Self {
        AttUuid::Long(uuid)
    }
}

impl From<u16> for AttUuid {
    fn from(short: u16) -> Self {
        AttUuid::Short(short as u32)
    }
}

impl fmt::Display for AttUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttUuid::Short(short) => write!(f, "0x{:04X}", short),
            AttUuid::Long(uuid) => write!(f, "{}", uuid.hyphenated().to_string().to_uppercase()),
            AttUuid::Other(raw) => f.write_str(raw),
        }
    }
}

/// A discovered GATT characteristic. Immutable once discovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicHandle {
    #[serde(rename = "UUID")]
    pub uuid: AttUuid,
    pub start_handle: u16,
    pub end_handle: u16,
    pub value_handle: u16,
}

/// A discovered characteristic descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorHandle {
    #[serde(rename = "UUID")]
    pub uuid: AttUuid,
    pub handle: u16,
}

/// A discovered primary service with its characteristics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredService {
    #[serde(rename = "UUID")]
    pub uuid: AttUuid,
    pub start_handle: u16,
    pub end_handle: u16,
    pub characteristics: Vec<CharacteristicHandle>,
}

/// The UART characteristic a handle plays in the echo test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CharacteristicRole {
    Rx,
    Tx,
}

impl CharacteristicRole {
    /// Classify a characteristic UUID into its UART role.
    pub fn classify(uuid: &AttUuid) -> Option<Self> {
        if uuid.matches(&UART_RX_CHAR_UUID) {
            Some(CharacteristicRole::Rx)
        } else if uuid.matches(&UART_TX_CHAR_UUID) {
            Some(CharacteristicRole::Tx)
        } else {
            None
        }
    }
}

impl fmt::Display for CharacteristicRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CharacteristicRole::Rx => f.write_str("RX"),
            CharacteristicRole::Tx => f.write_str("TX"),
        }
    }
}

/// Everything the echo test needs from the peripheral's GATT table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UartEndpoints {
    pub rx: CharacteristicHandle,
    pub tx: CharacteristicHandle,
    pub rx_cccd: DescriptorHandle,
}

/// Values written to the RX CCCD, little-endian 16-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CccdValue {
    Notifications,
    Disabled,
}

impl CccdValue {
    /// The value as the 4-character hex string the client writes.
    pub fn as_hex(&self) -> &'static str {
        match self {
            CccdValue::Notifications => "0100",
            CccdValue::Disabled => "0000",
        }
    }
}
