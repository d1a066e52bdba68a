//! UART handle discovery
//!
//! Walks the peripheral's GATT table to find the UART service, its RX and
//! TX characteristics, and the RX characteristic's CCCD.

use crate::ble::gatt::{
    AttUuid, CharacteristicHandle, CharacteristicRole, DescriptorHandle, UartEndpoints, CCCD_UUID,
    UART_SERVICE_UUID,
};
use crate::ble::transport::{ConnectionInfo, GattClient};

use super::cache::HandleCache;
use super::{DiscoveryError, EchoError, GattOperation};

/// Query the peripheral for its UART endpoints.
///
/// Issues one service/characteristic enumeration and one descriptor
/// enumeration. Transport failures on either abort without retry.
pub async fn discover_uart_endpoints(
    client: &dyn GattClient,
    connection: &ConnectionInfo,
) -> Result<UartEndpoints, EchoError> {
    let handle = connection.connection_handle;

    let services = client
        .discover_services(handle)
        .await
        .map_err(|e| EchoError::protocol(GattOperation::DiscoverServices, Some(handle), e))?;

    let mut rx: Option<CharacteristicHandle> = None;
    let mut tx: Option<CharacteristicHandle> = None;

    for service in &services {
        log::debug!("Service {} [{:#06x}-{:#06x}]", service.uuid, service.start_handle, service.end_handle);
        if !service.uuid.matches(&UART_SERVICE_UUID) {
            continue;
        }
        log::info!("Found UART service on connection {}", handle);
        for characteristic in &service.characteristics {
            match CharacteristicRole::classify(&characteristic.uuid) {
                Some(CharacteristicRole::Rx) if rx.is_none() => rx = Some(characteristic.clone()),
                Some(CharacteristicRole::Tx) if tx.is_none() => tx = Some(characteristic.clone()),
                _ => {}
            }
        }
    }

    let missing = |role| EchoError::Discovery {
        connection_handle: handle,
        source: DiscoveryError::MissingCharacteristic { role },
    };
    let rx = rx.ok_or_else(|| missing(CharacteristicRole::Rx))?;
    let tx = tx.ok_or_else(|| missing(CharacteristicRole::Tx))?;

    let descriptors = client
        .discover_descriptors(handle, rx.start_handle, rx.end_handle)
        .await
        .map_err(|e| EchoError::protocol(GattOperation::DiscoverDescriptors, Some(handle), e))?;

    let rx_cccd = find_cccd(descriptors).ok_or(EchoError::Discovery {
        connection_handle: handle,
        source: DiscoveryError::MissingDescriptor {
            characteristic: CharacteristicRole::Rx,
        },
    })?;

    log::info!(
        "UART handles: rx value {:#06x}, tx value {:#06x}, rx cccd {:#06x}",
        rx.value_handle,
        tx.value_handle,
        rx_cccd.handle
    );

    Ok(UartEndpoints { rx, tx, rx_cccd })
}

/// Pick the CCCD out of a descriptor listing.
///
/// Descriptors whose UUID cannot be reduced to a 16-bit value are skipped
/// rather than treated as an error; a 128-bit UUID on the Bluetooth base
/// still counts.
fn find_cccd(descriptors: Vec<DescriptorHandle>) -> Option<DescriptorHandle> {
    descriptors.into_iter().find(|descriptor| match descriptor.uuid.as_short() {
        Some(short) => short == CCCD_UUID as u32,
        None => {
            if let AttUuid::Other(raw) = &descriptor.uuid {
                log::debug!("Skipping descriptor {:#06x} with uuid '{}'", descriptor.handle, raw);
            }
            false
        }
    })
}

/// Return the endpoints for this connection's peer, discovering them on
/// first use only.
pub async fn discover_cached(
    cache: &HandleCache,
    client: &dyn GattClient,
    connection: &ConnectionInfo,
) -> Result<UartEndpoints, EchoError> {
    cache
        .get_or_discover(&connection.peer_address, || {
            discover_uart_endpoints(client, connection)
        })
        .await
}
