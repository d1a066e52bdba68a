//! Randomized echo workload
//!
//! Writes payloads to the TX characteristic and checks that each one comes
//! back byte-exact as an RX notification. Payloads travel as uppercase hex,
//! two characters per byte; the echoed hex is compared ignoring case only.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::ble::events::DeviceEvent;
use crate::ble::transport::{ConnectionHandle, GattClient};

use super::correlator::EventCorrelator;
use super::session::{EchoSession, SubscriptionState};
use super::{EchoError, GattOperation};

/// Signals an echo loop to stop at its next iteration boundary.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observed by the echo loop between iterations. In-flight requests are
/// never interrupted.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn pair() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelToken { rx })
    }

    /// A token nobody can cancel.
    pub fn never() -> CancelToken {
        Self::pair().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Totals for a completed echo loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EchoStats {
    pub iterations: u64,
    pub bytes_echoed: u64,
    pub elapsed: Duration,
}

/// Matches RX notifications for one connection.
pub fn rx_notification(
    connection_handle: ConnectionHandle,
    rx_value_handle: u16,
) -> impl Fn(&DeviceEvent) -> bool {
    move |event: &DeviceEvent| event.is_notification_for(connection_handle, rx_value_handle)
}

pub struct EchoEngine {
    client: Arc<dyn GattClient>,
    correlator: Arc<EventCorrelator>,
    wait_timeout: Duration,
    pacing: Duration,
    rng: StdRng,
}

impl EchoEngine {
    pub fn new(
        client: Arc<dyn GattClient>,
        correlator: Arc<EventCorrelator>,
        wait_timeout: Duration,
        pacing: Duration,
    ) -> Self {
        Self {
            client,
            correlator,
            wait_timeout,
            pacing,
            rng: StdRng::from_entropy(),
        }
    }

    /// Use a fixed seed so payload sequences are reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Uniformly random length in `[min_size, max_size]`, uniformly random bytes.
    fn random_payload(&mut self, min_size: usize, max_size: usize) -> Vec<u8> {
        let len = self.rng.gen_range(min_size..=max_size);
        let mut payload = vec![0u8; len];
        self.rng.fill(&mut payload[..]);
        payload
    }

    /// Send one payload and verify its echo.
    pub async fn echo_once(&self, session: &EchoSession, payload: &[u8]) -> Result<(), EchoError> {
        let connection = session.connection.connection_handle;
        if session.subscription != SubscriptionState::Subscribed {
            return Err(EchoError::InvalidState(format!(
                "connection {} is not subscribed to RX notifications",
                connection
            )));
        }

        let sent = hex::encode_upper(payload);
        self.client
            .write_without_response(connection, session.endpoints.tx.value_handle, &sent)
            .await
            .map_err(|e| EchoError::protocol(GattOperation::WriteTx, Some(connection), e))?;

        let event = self
            .correlator
            .wait_for(
                rx_notification(connection, session.endpoints.rx.value_handle),
                self.wait_timeout,
            )
            .await
            .map_err(|e| e.into_echo_error("RX notification", Some(connection)))?;

        let DeviceEvent::Notification { data: received, .. } = event else {
            return Err(EchoError::InvalidState(
                "correlator returned a non-notification event".into(),
            ));
        };
        log::debug!("Received data: {}", received);

        if !received.eq_ignore_ascii_case(&sent) {
            return Err(EchoError::Mismatch {
                connection_handle: connection,
                sent,
                received,
            });
        }
        Ok(())
    }

    /// Echo random payloads until `duration` has elapsed.
    ///
    /// Stops at the first failed echo, or when `cancel` fires, without
    /// attempting further iterations.
    pub async fn run_for(
        &mut self,
        session: &EchoSession,
        duration: Duration,
        min_size: usize,
        cancel: &CancelToken,
    ) -> Result<EchoStats, EchoError> {
        let max_size = session.mtu();
        if min_size == 0 || min_size > max_size {
            return Err(EchoError::InvalidArgument(format!(
                "minimum payload size {} outside 1..={}",
                min_size, max_size
            )));
        }

        log::info!(
            "Echo loop for {:?} on connection {}, payloads {}-{} bytes",
            duration,
            session.connection.connection_handle,
            min_size,
            max_size
        );

        let start = Instant::now();
        let mut stats = EchoStats::default();

        while start.elapsed() < duration {
            if cancel.is_cancelled() {
                log::warn!("Echo loop cancelled after {} iterations", stats.iterations);
                return Err(EchoError::Cancelled);
            }

            let payload = self.random_payload(min_size, max_size);
            if let Err(e) = self.echo_once(session, &payload).await {
                log::error!("Echo failed after {} iterations: {}", stats.iterations, e);
                return Err(e);
            }
            stats.iterations += 1;
            stats.bytes_echoed += payload.len() as u64;

            tokio::time::sleep(self.pacing).await;
        }

        stats.elapsed = start.elapsed();
        log::info!(
            "Echo loop passed: {} iterations, {} bytes in {:?}",
            stats.iterations,
            stats.bytes_echoed,
            stats.elapsed
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::simulated::{
        EchoBehavior, SimOperation, SimPeripheralConfig, SimUartPeripheral, SIM_RX_VALUE_HANDLE,
        SIM_TX_VALUE_HANDLE,
    };
    use crate::ble::transport::AddressType;
    use crate::echo::discovery::discover_uart_endpoints;
    use crate::echo::subscription::SubscriptionController;

    struct Rig {
        sim: Arc<SimUartPeripheral>,
        engine: EchoEngine,
        session: EchoSession,
    }

    async fn rig(config: SimPeripheralConfig, subscribe: bool) -> Rig {
        let (sim, events) = SimUartPeripheral::new(config);
        sim.init().await.unwrap();
        let addr = *sim.address();
        let info = sim.connect(&addr, AddressType::Random).await.unwrap();
        let endpoints = discover_uart_endpoints(sim.as_ref(), &info).await.unwrap();
        let mut session = EchoSession::new(info, endpoints);
        if subscribe {
            SubscriptionController::new(sim.clone())
                .subscribe(&mut session)
                .await
                .unwrap();
        }
        let engine = EchoEngine::new(
            sim.clone(),
            Arc::new(EventCorrelator::new(events)),
            Duration::from_secs(10),
            Duration::from_millis(10),
        )
        .with_seed(7);
        Rig { sim, engine, session }
    }

    #[tokio::test]
    async fn test_echo_once_matches() {
        let rig = rig(SimPeripheralConfig::default(), true).await;
        rig.engine
            .echo_once(&rig.session, &[0x01, 0x02, 0x03, 0x04, 0x05])
            .await
            .unwrap();

        let writes: Vec<_> = rig
            .sim
            .operations()
            .await
            .into_iter()
            .filter(|op| matches!(op, SimOperation::Write { .. }))
            .collect();
        assert_eq!(
            writes,
            vec![SimOperation::Write {
                handle: SIM_TX_VALUE_HANDLE,
                data: "0102030405".into(),
            }]
        );
    }

    #[tokio::test]
    async fn test_echo_compare_ignores_case() {
        let rig = rig(
            SimPeripheralConfig {
                echo: EchoBehavior::Lowercase,
                ..Default::default()
            },
            true,
        )
        .await;
        rig.engine
            .echo_once(&rig.session, &[0xAB, 0xCD, 0xEF])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_echo_once_mismatch() {
        let rig = rig(
            SimPeripheralConfig {
                echo: EchoBehavior::Corrupt,
                ..Default::default()
            },
            true,
        )
        .await;
        let err = rig
            .engine
            .echo_once(&rig.session, &[0x01, 0x02, 0x03, 0x04, 0x05])
            .await
            .unwrap_err();
        match err {
            EchoError::Mismatch { connection_handle, sent, received } => {
                assert_eq!(connection_handle, 0);
                assert_eq!(sent, "0102030405");
                assert_eq!(received, "0102030404");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_echo_skips_unrelated_events() {
        let rig = rig(
            SimPeripheralConfig {
                noise: true,
                ..Default::default()
            },
            true,
        )
        .await;
        rig.engine.echo_once(&rig.session, &[0x42]).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_once_timeout() {
        let rig = rig(
            SimPeripheralConfig {
                echo: EchoBehavior::Drop,
                ..Default::default()
            },
            true,
        )
        .await;
        let start = Instant::now();
        let err = rig.engine.echo_once(&rig.session, &[0x01]).await.unwrap_err();
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(matches!(err, EchoError::Timeout { connection_handle: Some(0), .. }));
    }

    #[tokio::test]
    async fn test_echo_requires_subscription() {
        let rig = rig(SimPeripheralConfig::default(), false).await;
        let err = rig.engine.echo_once(&rig.session, &[0x01]).await.unwrap_err();
        assert!(matches!(err, EchoError::InvalidState(_)));
        assert!(rig.sim.operations().await.iter().all(|op| !matches!(op, SimOperation::Write { .. })));
    }

    #[tokio::test]
    async fn test_random_payload_bounds() {
        let mut rig = rig(SimPeripheralConfig::default(), false).await;
        for _ in 0..200 {
            let payload = rig.engine.random_payload(3, 20);
            assert!((3..=20).contains(&payload.len()));
        }
        assert_eq!(rig.engine.random_payload(5, 5).len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_for_completes_after_duration() {
        let mut rig = rig(SimPeripheralConfig::default(), true).await;
        let start = Instant::now();
        let stats = rig
            .engine
            .run_for(&rig.session, Duration::from_secs(10), 1, &CancelToken::never())
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(stats.elapsed >= Duration::from_secs(10));
        assert!(stats.iterations > 1);
        assert!(stats.bytes_echoed >= stats.iterations);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_for_stops_on_first_failure() {
        let mut rig = rig(
            SimPeripheralConfig {
                echo: EchoBehavior::Corrupt,
                ..Default::default()
            },
            true,
        )
        .await;
        let err = rig
            .engine
            .run_for(&rig.session, Duration::from_secs(10), 1, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, EchoError::Mismatch { .. }));

        let writes = rig
            .sim
            .operations()
            .await
            .into_iter()
            .filter(|op| matches!(op, SimOperation::Write { .. }))
            .count();
        assert_eq!(writes, 1);
    }

    #[tokio::test]
    async fn test_run_for_honours_cancellation() {
        let mut rig = rig(SimPeripheralConfig::default(), true).await;
        let (handle, token) = CancelToken::pair();
        handle.cancel();
        let err = rig
            .engine
            .run_for(&rig.session, Duration::from_secs(10), 1, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, EchoError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_for_stops_on_tx_write_failure() {
        let mut rig = rig(
            SimPeripheralConfig {
                fail_tx_writes: true,
                ..Default::default()
            },
            true,
        )
        .await;
        let err = rig
            .engine
            .run_for(&rig.session, Duration::from_secs(10), 1, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EchoError::Protocol { operation: GattOperation::WriteTx, connection_handle: Some(0), .. }
        ));

        let writes = rig
            .sim
            .operations()
            .await
            .into_iter()
            .filter(|op| matches!(op, SimOperation::Write { .. }))
            .count();
        assert_eq!(writes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_echo_finishes_current_iteration() {
        let mut rig = rig(
            SimPeripheralConfig {
                latency: Duration::from_millis(500),
                ..Default::default()
            },
            true,
        )
        .await;
        let (handle, token) = CancelToken::pair();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.cancel();
        });

        let start = Instant::now();
        let err = rig
            .engine
            .run_for(&rig.session, Duration::from_secs(10), 1, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, EchoError::Cancelled));
        // The echo in flight at cancel time ran to its notification.
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(start.elapsed() < Duration::from_secs(10));

        let writes = rig
            .sim
            .operations()
            .await
            .into_iter()
            .filter(|op| matches!(op, SimOperation::Write { .. }))
            .count();
        assert_eq!(writes, 1);
    }

    #[tokio::test]
    async fn test_run_for_rejects_bad_min_size() {
        let mut rig = rig(SimPeripheralConfig::default(), true).await;
        let never = CancelToken::never();
        for min in [0, 21] {
            let err = rig
                .engine
                .run_for(&rig.session, Duration::from_secs(1), min, &never)
                .await
                .unwrap_err();
            assert!(matches!(err, EchoError::InvalidArgument(_)));
        }
    }

    #[test]
    fn test_rx_notification_predicate() {
        let matches = rx_notification(0, SIM_RX_VALUE_HANDLE);
        assert!(matches(&DeviceEvent::Notification {
            connection_handle: 0,
            characteristic_handle: SIM_RX_VALUE_HANDLE,
            data: String::new(),
        }));
        assert!(!matches(&DeviceEvent::Other { kind: "x".into() }));
    }
}
