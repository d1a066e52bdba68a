//! Connection establishment
//!
//! Initializes the radio, opens the link and tightens the connection
//! parameters for sustained echo traffic. The parameter change is only
//! trusted once the stack confirms it on the event stream.

use std::sync::Arc;
use std::time::Duration;

use crate::ble::events::{DeviceEvent, EventStatus};
use crate::ble::transport::{
    AddressType, ConnectionHandle, ConnectionInfo, ConnectionParameters, GattClient, PeerAddress,
};

use super::correlator::EventCorrelator;
use super::{EchoError, GattOperation};

pub struct ConnectionManager {
    client: Arc<dyn GattClient>,
    correlator: Arc<EventCorrelator>,
    params: ConnectionParameters,
    confirm_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(
        client: Arc<dyn GattClient>,
        correlator: Arc<EventCorrelator>,
        params: ConnectionParameters,
        confirm_timeout: Duration,
    ) -> Self {
        Self {
            client,
            correlator,
            params,
            confirm_timeout,
        }
    }

    /// Bring up a link to `address` with test connection parameters.
    ///
    /// Each step runs only if the previous one succeeded. If a step after
    /// the link opens fails, the link is closed before the error returns.
    pub async fn connect(
        &self,
        address: &PeerAddress,
        address_type: AddressType,
    ) -> Result<ConnectionInfo, EchoError> {
        self.client
            .init()
            .await
            .map_err(|e| EchoError::protocol(GattOperation::Init, None, e))?;
        log::info!("BLE initialized");

        let info = self
            .client
            .connect(address, address_type)
            .await
            .map_err(|e| EchoError::protocol(GattOperation::Connect, None, e))?;
        log::info!(
            "Connected to {} ({}) as connection {}",
            address,
            address_type,
            info.connection_handle
        );

        if let Err(e) = self.negotiate(info.connection_handle).await {
            if let Err(close) = self.client.disconnect(info.connection_handle).await {
                log::warn!(
                    "Failed to close connection {} after setup error: {}",
                    info.connection_handle,
                    close
                );
            }
            return Err(e);
        }

        Ok(info)
    }

    async fn negotiate(&self, connection: ConnectionHandle) -> Result<(), EchoError> {
        self.client
            .update_connection_parameters(connection, &self.params)
            .await
            .map_err(|e| {
                EchoError::protocol(GattOperation::UpdateParameters, Some(connection), e)
            })?;

        let event = self
            .correlator
            .wait_for(
                |event| {
                    matches!(
                        event,
                        DeviceEvent::ConnectionParametersUpdated { connection_handle, .. }
                            if *connection_handle == connection
                    )
                },
                self.confirm_timeout,
            )
            .await
            .map_err(|e| e.into_echo_error("connection parameter update", Some(connection)))?;

        match event {
            DeviceEvent::ConnectionParametersUpdated {
                status: EventStatus::Failure(status),
                ..
            } => Err(EchoError::ParameterUpdateRejected {
                connection_handle: connection,
                status,
            }),
            _ => {
                log::info!(
                    "Connection {} parameters updated: interval {}-{} ms, latency {}, timeout {} ms",
                    connection,
                    self.params.interval_min_ms(),
                    self.params.interval_max_ms(),
                    self.params.peripheral_latency,
                    self.params.supervision_timeout_ms()
                );
                Ok(())
            }
        }
    }
}
