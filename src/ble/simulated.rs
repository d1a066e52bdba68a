//! In-process UART echo peripheral
//!
//! Implements [`GattClient`] against a simulated device under test that
//! exposes a GAP service and the UART service, and echoes every TX write
//! back as an RX notification on the device event channel. Used for
//! integration testing and the command line self-test without BLE
//! hardware. Faults can be injected through [`SimPeripheralConfig`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::events::{DeviceEvent, EventStatus};
use super::gatt::{
    AttUuid, CharacteristicHandle, DescriptorHandle, DiscoveredService, CCCD_UUID,
    UART_RX_CHAR_UUID, UART_SERVICE_UUID, UART_TX_CHAR_UUID,
};
use super::transport::{
    AddressType, ConnectionHandle, ConnectionInfo, ConnectionParameters, GattClient, PeerAddress,
};
use super::BleError;

pub const SIM_UART_SERVICE_START: u16 = 0x000C;
pub const SIM_RX_VALUE_HANDLE: u16 = 0x000E;
pub const SIM_RX_VENDOR_DESCRIPTOR_HANDLE: u16 = 0x0010;
pub const SIM_RX_CCCD_HANDLE: u16 = 0x0011;
pub const SIM_TX_VALUE_HANDLE: u16 = 0x0013;

/// How the simulated peripheral answers TX writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EchoBehavior {
    /// Echo the bytes back unchanged.
    Lossless,
    /// Echo the bytes back with lowercase hex digits.
    Lowercase,
    /// Echo with the last byte altered.
    Corrupt,
    /// Never answer.
    Drop,
}

/// How the simulated peripheral answers connection parameter requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamUpdateBehavior {
    Confirm,
    Reject(String),
    /// Accept the request but never report completion.
    Silent,
}

/// Shape and faults of the simulated peripheral.
#[derive(Debug, Clone)]
pub struct SimPeripheralConfig {
    pub address: PeerAddress,
    pub connection_handle: ConnectionHandle,
    pub include_rx: bool,
    pub include_tx: bool,
    pub include_cccd: bool,
    /// Report the UART service UUID as an opaque string instead of a parsed UUID.
    pub opaque_service_uuid: bool,
    /// Add an unparseable descriptor UUID ahead of the CCCD.
    pub vendor_descriptor: bool,
    pub echo: EchoBehavior,
    pub param_update: ParamUpdateBehavior,
    pub fail_init: bool,
    pub fail_writes: bool,
    /// Fail TX characteristic writes only; CCCD writes still succeed.
    pub fail_tx_writes: bool,
    pub fail_service_query: bool,
    pub fail_descriptor_query: bool,
    /// Emit an unrelated event ahead of every echo.
    pub noise: bool,
    /// Delay before each asynchronous event is delivered.
    pub latency: Duration,
}

impl Default for SimPeripheralConfig {
    fn default() -> Self {
        Self {
            address: PeerAddress([0xEB, 0x59, 0xB8, 0x48, 0x1D, 0x4D]),
            connection_handle: 0,
            include_rx: true,
            include_tx: true,
            include_cccd: true,
            opaque_service_uuid: false,
            vendor_descriptor: false,
            echo: EchoBehavior::Lossless,
            param_update: ParamUpdateBehavior::Confirm,
            fail_init: false,
            fail_writes: false,
            fail_tx_writes: false,
            fail_service_query: false,
            fail_descriptor_query: false,
            noise: false,
            latency: Duration::from_millis(2),
        }
    }
}

/// A client-side operation observed by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOperation {
    Init,
    Connect(PeerAddress, AddressType),
    UpdateParameters(ConnectionParameters),
    DiscoverServices,
    DiscoverDescriptors { start_handle: u16, end_handle: u16 },
    WriteDescriptor { handle: u16, value: String },
    SetUnsolicitedHvx(bool),
    Write { handle: u16, data: String },
    Disconnect,
    Reset,
}

/// A simulated UART echo peripheral reached through a simulated BLE stack.
pub struct SimUartPeripheral {
    config: SimPeripheralConfig,
    events: mpsc::Sender<DeviceEvent>,
    initialized: AtomicBool,
    connection: Mutex<Option<ConnectionInfo>>,
    cccd_enabled: AtomicBool,
    hvx_armed: AtomicBool,
    service_queries: AtomicUsize,
    descriptor_queries: AtomicUsize,
    operations: Mutex<Vec<SimOperation>>,
}

impl SimUartPeripheral {
    /// Create a peripheral and the device event stream it reports on.
    pub fn new(config: SimPeripheralConfig) -> (Arc<Self>, mpsc::Receiver<DeviceEvent>) {
        let (events, rx) = mpsc::channel(256);
        let peripheral = Arc::new(Self {
            config,
            events,
            initialized: AtomicBool::new(false),
            connection: Mutex::new(None),
            cccd_enabled: AtomicBool::new(false),
            hvx_armed: AtomicBool::new(false),
            service_queries: AtomicUsize::new(0),
            descriptor_queries: AtomicUsize::new(0),
            operations: Mutex::new(Vec::new()),
        });
        (peripheral, rx)
    }

    pub fn address(&self) -> &PeerAddress {
        &self.config.address
    }

    /// Number of service/characteristic enumerations served.
    pub fn service_queries(&self) -> usize {
        self.service_queries.load(Ordering::SeqCst)
    }

    /// Number of descriptor enumerations served.
    pub fn descriptor_queries(&self) -> usize {
        self.descriptor_queries.load(Ordering::SeqCst)
    }

    pub fn cccd_enabled(&self) -> bool {
        self.cccd_enabled.load(Ordering::SeqCst)
    }

    pub fn hvx_armed(&self) -> bool {
        self.hvx_armed.load(Ordering::SeqCst)
    }

    /// Every operation issued so far, in order.
    pub async fn operations(&self) -> Vec<SimOperation> {
        self.operations.lock().await.clone()
    }

    /// Deliver an arbitrary event on the device event stream.
    pub async fn inject(&self, event: DeviceEvent) {
        let _ = self.events.send(event).await;
    }

    async fn record(&self, op: SimOperation) {
        self.operations.lock().await.push(op);
    }

    async fn require_connection(&self, connection: ConnectionHandle) -> Result<(), BleError> {
        match self.connection.lock().await.as_ref() {
            Some(info) if info.connection_handle == connection => Ok(()),
            Some(_) => Err(BleError::GattError(format!(
                "unknown connection handle {}",
                connection
            ))),
            None => Err(BleError::Disconnected),
        }
    }

    /// Deliver events after the configured latency without blocking the caller.
    fn deliver_later(&self, events: Vec<DeviceEvent>) {
        let sender = self.events.clone();
        let latency = self.config.latency;
        tokio::spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            for event in events {
                if sender.send(event).await.is_err() {
                    break;
                }
            }
        });
    }

    fn echo_payload(&self, data_hex: &str) -> Option<String> {
        match self.config.echo {
            EchoBehavior::Lossless => Some(data_hex.to_string()),
            EchoBehavior::Lowercase => Some(data_hex.to_ascii_lowercase()),
            EchoBehavior::Corrupt => {
                let mut bytes = hex::decode(data_hex).unwrap_or_default();
                match bytes.last_mut() {
                    Some(last) => *last ^= 0x01,
                    None => bytes.push(0x00),
                }
                Some(hex::encode_upper(bytes))
            }
            EchoBehavior::Drop => None,
        }
    }

    fn gatt_table(&self) -> Vec<DiscoveredService> {
        let gap = DiscoveredService {
            uuid: AttUuid::from(0x1800u16),
            start_handle: 0x0001,
            end_handle: 0x0007,
            characteristics: vec![CharacteristicHandle {
                uuid: AttUuid::from(0x2A00u16),
                start_handle: 0x0002,
                end_handle: 0x0003,
                value_handle: 0x0003,
            }],
        };

        let mut characteristics = Vec::new();
        if self.config.include_rx {
            characteristics.push(CharacteristicHandle {
                uuid: AttUuid::from(UART_RX_CHAR_UUID),
                start_handle: 0x000D,
                end_handle: SIM_RX_CCCD_HANDLE,
                value_handle: SIM_RX_VALUE_HANDLE,
            });
        }
        if self.config.include_tx {
            characteristics.push(CharacteristicHandle {
                uuid: AttUuid::Other(UART_TX_CHAR_UUID.hyphenated().to_string().to_uppercase()),
                start_handle: 0x0012,
                end_handle: SIM_TX_VALUE_HANDLE,
                value_handle: SIM_TX_VALUE_HANDLE,
            });
        }

        let uart_uuid = if self.config.opaque_service_uuid {
            AttUuid::Other(UART_SERVICE_UUID.hyphenated().to_string().to_uppercase())
        } else {
            AttUuid::from(UART_SERVICE_UUID)
        };

        vec![
            gap,
            DiscoveredService {
                uuid: uart_uuid,
                start_handle: SIM_UART_SERVICE_START,
                end_handle: SIM_TX_VALUE_HANDLE,
                characteristics,
            },
        ]
    }

    fn descriptors_in(&self, start_handle: u16, end_handle: u16) -> Vec<DescriptorHandle> {
        let mut descriptors = vec![DescriptorHandle {
            uuid: AttUuid::from(0x2901u16),
            handle: 0x000F,
        }];
        if self.config.vendor_descriptor {
            descriptors.push(DescriptorHandle {
                uuid: AttUuid::Other("vendor:rx-format".into()),
                handle: SIM_RX_VENDOR_DESCRIPTOR_HANDLE,
            });
        }
        if self.config.include_cccd {
            descriptors.push(DescriptorHandle {
                uuid: AttUuid::from(CCCD_UUID),
                handle: SIM_RX_CCCD_HANDLE,
            });
        }
        descriptors
            .into_iter()
            .filter(|d| d.handle >= start_handle && d.handle <= end_handle)
            .collect()
    }
}

#[async_trait]
impl GattClient for SimUartPeripheral {
    async fn init(&self) -> Result<(), BleError> {
        self.record(SimOperation::Init).await;
        if self.config.fail_init {
            return Err(BleError::GattError("radio init failed".into()));
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(
        &self,
        address: &PeerAddress,
        address_type: AddressType,
    ) -> Result<ConnectionInfo, BleError> {
        self.record(SimOperation::Connect(*address, address_type)).await;
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(BleError::NotInitialized);
        }
        if address != &self.config.address {
            return Err(BleError::ConnectionError(format!(
                "No peripheral at {}",
                address
            )));
        }
        let info = ConnectionInfo {
            connection_handle: self.config.connection_handle,
            peer_address: *address,
            address_type,
        };
        *self.connection.lock().await = Some(info.clone());
        Ok(info)
    }

    async fn update_connection_parameters(
        &self,
        connection: ConnectionHandle,
        params: &ConnectionParameters,
    ) -> Result<(), BleError> {
        self.record(SimOperation::UpdateParameters(*params)).await;
        self.require_connection(connection).await?;

        let status = match &self.config.param_update {
            ParamUpdateBehavior::Confirm => EventStatus::Success,
            ParamUpdateBehavior::Reject(status) => EventStatus::Failure(status.clone()),
            ParamUpdateBehavior::Silent => return Ok(()),
        };
        self.deliver_later(vec![DeviceEvent::ConnectionParametersUpdated {
            connection_handle: connection,
            status,
        }]);
        Ok(())
    }

    async fn discover_services(
        &self,
        connection: ConnectionHandle,
    ) -> Result<Vec<DiscoveredService>, BleError> {
        self.record(SimOperation::DiscoverServices).await;
        self.require_connection(connection).await?;
        self.service_queries.fetch_add(1, Ordering::SeqCst);
        if self.config.fail_service_query {
            return Err(BleError::GattError("primary service discovery failed".into()));
        }
        Ok(self.gatt_table())
    }

    async fn discover_descriptors(
        &self,
        connection: ConnectionHandle,
        start_handle: u16,
        end_handle: u16,
    ) -> Result<Vec<DescriptorHandle>, BleError> {
        self.record(SimOperation::DiscoverDescriptors { start_handle, end_handle })
            .await;
        self.require_connection(connection).await?;
        self.descriptor_queries.fetch_add(1, Ordering::SeqCst);
        if self.config.fail_descriptor_query {
            return Err(BleError::GattError("descriptor discovery failed".into()));
        }
        Ok(self.descriptors_in(start_handle, end_handle))
    }

    async fn write_descriptor(
        &self,
        connection: ConnectionHandle,
        handle: u16,
        value_hex: &str,
    ) -> Result<(), BleError> {
        self.record(SimOperation::WriteDescriptor {
            handle,
            value: value_hex.to_string(),
        })
        .await;
        self.require_connection(connection).await?;
        if self.config.fail_writes {
            return Err(BleError::GattError("write rejected".into()));
        }
        if handle != SIM_RX_CCCD_HANDLE {
            return Err(BleError::GattError(format!("handle {:#06x} is not writable", handle)));
        }
        match value_hex {
            "0100" => self.cccd_enabled.store(true, Ordering::SeqCst),
            "0000" => self.cccd_enabled.store(false, Ordering::SeqCst),
            other => {
                return Err(BleError::GattError(format!("invalid CCCD value '{}'", other)));
            }
        }
        Ok(())
    }

    async fn set_unsolicited_hvx(&self, enabled: bool) -> Result<(), BleError> {
        self.record(SimOperation::SetUnsolicitedHvx(enabled)).await;
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(BleError::NotInitialized);
        }
        self.hvx_armed.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    async fn write_without_response(
        &self,
        connection: ConnectionHandle,
        handle: u16,
        data_hex: &str,
    ) -> Result<(), BleError> {
        self.record(SimOperation::Write {
            handle,
            data: data_hex.to_string(),
        })
        .await;
        self.require_connection(connection).await?;
        if self.config.fail_writes || self.config.fail_tx_writes {
            return Err(BleError::GattError("write rejected".into()));
        }
        if handle != SIM_TX_VALUE_HANDLE {
            return Err(BleError::GattError(format!("handle {:#06x} is not writable", handle)));
        }
        if hex::decode(data_hex).is_err() {
            return Err(BleError::GattError(format!("invalid hex payload '{}'", data_hex)));
        }

        if !(self.cccd_enabled() && self.hvx_armed()) {
            return Ok(());
        }
        let Some(echoed) = self.echo_payload(data_hex) else {
            return Ok(());
        };

        let mut events = Vec::new();
        if self.config.noise {
            events.push(DeviceEvent::Other {
                kind: "on_data_written".into(),
            });
            events.push(DeviceEvent::Notification {
                connection_handle: connection,
                characteristic_handle: 0x0003,
                data: "00".into(),
            });
        }
        events.push(DeviceEvent::Notification {
            connection_handle: connection,
            characteristic_handle: SIM_RX_VALUE_HANDLE,
            data: echoed,
        });
        self.deliver_later(events);
        Ok(())
    }

    async fn disconnect(&self, connection: ConnectionHandle) -> Result<(), BleError> {
        self.record(SimOperation::Disconnect).await;
        self.require_connection(connection).await?;
        *self.connection.lock().await = None;
        self.cccd_enabled.store(false, Ordering::SeqCst);
        self.deliver_later(vec![DeviceEvent::Disconnected {
            connection_handle: connection,
        }]);
        Ok(())
    }

    async fn reset(&self) -> Result<(), BleError> {
        self.record(SimOperation::Reset).await;
        self.hvx_armed.store(false, Ordering::SeqCst);
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }
}
