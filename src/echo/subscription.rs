//! RX notification subscription control

use std::sync::Arc;

use crate::ble::gatt::CccdValue;
use crate::ble::transport::GattClient;

use super::session::{EchoSession, SubscriptionState};
use super::{EchoError, GattOperation};

pub struct SubscriptionController {
    client: Arc<dyn GattClient>,
}

impl SubscriptionController {
    pub fn new(client: Arc<dyn GattClient>) -> Self {
        Self { client }
    }

    /// Enable RX notifications on the peripheral, then arm local delivery.
    ///
    /// On failure the session is left `Indeterminate` and must not enter
    /// the echo loop.
    pub async fn subscribe(&self, session: &mut EchoSession) -> Result<(), EchoError> {
        let handle = session.connection.connection_handle;
        session.subscription = SubscriptionState::Indeterminate;

        self.client
            .write_descriptor(handle, session.endpoints.rx_cccd.handle, CccdValue::Notifications.as_hex())
            .await
            .map_err(|e| EchoError::protocol(GattOperation::WriteCccd, Some(handle), e))?;

        self.client
            .set_unsolicited_hvx(true)
            .await
            .map_err(|e| EchoError::protocol(GattOperation::ArmNotifications, Some(handle), e))?;

        session.subscription = SubscriptionState::Subscribed;
        log::info!("Subscribed to RX notifications on connection {}", handle);
        Ok(())
    }

    /// Disarm local delivery first, then clear the CCCD.
    pub async fn unsubscribe(&self, session: &mut EchoSession) -> Result<(), EchoError> {
        let handle = session.connection.connection_handle;
        session.subscription = SubscriptionState::Indeterminate;

        self.client
            .set_unsolicited_hvx(false)
            .await
            .map_err(|e| EchoError::protocol(GattOperation::DisarmNotifications, Some(handle), e))?;

        self.client
            .write_descriptor(handle, session.endpoints.rx_cccd.handle, CccdValue::Disabled.as_hex())
            .await
            .map_err(|e| EchoError::protocol(GattOperation::WriteCccd, Some(handle), e))?;

        session.subscription = SubscriptionState::Unsubscribed;
        log::info!("Unsubscribed from RX notifications on connection {}", handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::simulated::{SimOperation, SimPeripheralConfig, SimUartPeripheral, SIM_RX_CCCD_HANDLE};
    use crate::ble::transport::AddressType;
    use crate::echo::discovery::discover_uart_endpoints;

    async fn session(config: SimPeripheralConfig) -> (Arc<SimUartPeripheral>, EchoSession) {
        let (sim, _events) = SimUartPeripheral::new(config);
        sim.init().await.unwrap();
        let addr = *sim.address();
        let info = sim.connect(&addr, AddressType::Random).await.unwrap();
        let endpoints = discover_uart_endpoints(sim.as_ref(), &info).await.unwrap();
        (sim, EchoSession::new(info, endpoints))
    }

    fn subscription_ops(ops: Vec<SimOperation>) -> Vec<SimOperation> {
        ops.into_iter()
            .filter(|op| {
                matches!(
                    op,
                    SimOperation::WriteDescriptor { .. } | SimOperation::SetUnsolicitedHvx(_)
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_subscribe_then_unsubscribe_order() {
        let (sim, mut session) = session(SimPeripheralConfig::default()).await;
        let controller = SubscriptionController::new(sim.clone());

        controller.subscribe(&mut session).await.unwrap();
        assert_eq!(session.subscription, SubscriptionState::Subscribed);
        assert!(sim.cccd_enabled() && sim.hvx_armed());

        controller.unsubscribe(&mut session).await.unwrap();
        assert_eq!(session.subscription, SubscriptionState::Unsubscribed);
        assert!(!sim.cccd_enabled() && !sim.hvx_armed());

        assert_eq!(
            subscription_ops(sim.operations().await),
            vec![
                SimOperation::WriteDescriptor {
                    handle: SIM_RX_CCCD_HANDLE,
                    value: "0100".into(),
                },
                SimOperation::SetUnsolicitedHvx(true),
                SimOperation::SetUnsolicitedHvx(false),
                SimOperation::WriteDescriptor {
                    handle: SIM_RX_CCCD_HANDLE,
                    value: "0000".into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_cccd_write_leaves_indeterminate() {
        let (sim, mut session) = session(SimPeripheralConfig {
            fail_writes: true,
            ..Default::default()
        })
        .await;
        let controller = SubscriptionController::new(sim.clone());

        let err = controller.subscribe(&mut session).await.unwrap_err();
        assert!(matches!(
            err,
            EchoError::Protocol { operation: GattOperation::WriteCccd, connection_handle: Some(0), .. }
        ));
        assert_eq!(session.subscription, SubscriptionState::Indeterminate);
        // Listening is never armed after the descriptor write fails.
        assert!(!sim.hvx_armed());
    }
}
