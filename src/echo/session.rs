//! Echo session driver
//!
//! Runs one test session against one peripheral: connect, discover (first
//! time only), subscribe, echo, unsubscribe, release. Any failure skips the
//! remaining forward steps but teardown is still attempted, and the session
//! reports a single pass/fail plus the first error raised.

use std::sync::Arc;

use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::ble::gatt::UartEndpoints;
use crate::ble::transport::{AddressType, ConnectionHandle, ConnectionInfo, GattClient, PeerAddress};
use crate::config::EchoConfig;

use super::cache::HandleCache;
use super::connection::ConnectionManager;
use super::correlator::EventCorrelator;
use super::discovery::discover_cached;
use super::engine::{CancelToken, EchoEngine, EchoStats};
use super::subscription::SubscriptionController;
use super::{EchoError, GattOperation};

/// Payload MTU used until the session negotiates a larger one.
pub const DEFAULT_MTU: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribed,
    /// A subscribe or unsubscribe step failed part way.
    Indeterminate,
}

/// Per-connection state owned by a single session.
#[derive(Debug, Clone)]
pub struct EchoSession {
    pub client_id: Uuid,
    pub connection: ConnectionInfo,
    pub endpoints: UartEndpoints,
    pub subscription: SubscriptionState,
    mtu: usize,
    mtu_updated: bool,
}

impl EchoSession {
    pub fn new(connection: ConnectionInfo, endpoints: UartEndpoints) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            connection,
            endpoints,
            subscription: SubscriptionState::Unsubscribed,
            mtu: DEFAULT_MTU,
            mtu_updated: false,
        }
    }

    /// Largest payload the echo loop may send.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Change the payload MTU. Allowed once per connection.
    pub fn update_mtu(&mut self, mtu: usize) -> Result<(), EchoError> {
        if self.mtu_updated {
            return Err(EchoError::InvalidState(format!(
                "MTU already updated on connection {}",
                self.connection.connection_handle
            )));
        }
        if mtu == 0 {
            return Err(EchoError::InvalidArgument("MTU must be at least 1".into()));
        }
        self.mtu = mtu;
        self.mtu_updated = true;
        Ok(())
    }
}

/// Externally supplied test trigger: `"<mac>,<address type code>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestTrigger {
    pub address: PeerAddress,
    pub address_type: AddressType,
}

impl TestTrigger {
    pub fn parse(value: &str) -> Result<Self, EchoError> {
        let (mac, code) = value.split_once(',').ok_or_else(|| {
            EchoError::InvalidArgument(format!("expected '<mac>,<address type>', got '{}'", value))
        })?;
        let address: PeerAddress = mac.parse().map_err(EchoError::InvalidArgument)?;
        let code: u8 = code
            .trim()
            .parse()
            .map_err(|_| EchoError::InvalidArgument(format!("invalid address type '{}'", code.trim())))?;
        let address_type = AddressType::from_code(code)
            .ok_or_else(|| EchoError::InvalidArgument(format!("unknown address type code {}", code)))?;
        Ok(Self {
            address,
            address_type,
        })
    }
}

/// What the echo step of a session does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EchoPlan {
    /// Echo one fixed payload.
    Single(Vec<u8>),
    /// Echo random payloads for `duration`, each at least `min_size` bytes.
    Timed {
        duration: std::time::Duration,
        min_size: usize,
    },
}

impl EchoPlan {
    /// The fixed probe the harness sends when no workload is configured.
    pub fn probe() -> Self {
        EchoPlan::Single(vec![0x01, 0x02, 0x03, 0x04, 0x05])
    }

    pub fn from_config(config: &EchoConfig) -> Self {
        EchoPlan::Timed {
            duration: config.run_duration(),
            min_size: config.min_payload_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Connecting,
    Discovering,
    Subscribing,
    EchoLoop,
    Unsubscribing,
    Released,
}

/// States visited by a session, in order.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct StateLog(Vec<SessionState>);

impl StateLog {
    fn enter(&mut self, state: SessionState) {
        log::debug!("Session -> {:?}", state);
        self.0.push(state);
    }

    pub fn states(&self) -> &[SessionState] {
        &self.0
    }

    pub fn visited(&self, state: SessionState) -> bool {
        self.0.contains(&state)
    }
}

/// Outcome handed back to the invoking harness.
#[derive(Debug, Serialize)]
pub struct SessionReport {
    pub passed: bool,
    pub client_id: Uuid,
    pub peer: String,
    pub connection_handle: Option<ConnectionHandle>,
    pub states: StateLog,
    pub stats: Option<EchoStats>,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<EchoError>,
}

fn serialize_error<S: Serializer>(error: &Option<EchoError>, serializer: S) -> Result<S::Ok, S::Error> {
    #[derive(Serialize)]
    struct Reported<'a> {
        kind: &'a str,
        message: String,
        connection_handle: Option<ConnectionHandle>,
    }

    error
        .as_ref()
        .map(|e| Reported {
            kind: e.kind(),
            message: e.to_string(),
            connection_handle: e.connection_handle(),
        })
        .serialize(serializer)
}

/// Mutable bookkeeping for one run, split so forward steps can hold the
/// session while still logging state transitions.
struct SessionRun {
    states: StateLog,
    connection: Option<ConnectionInfo>,
    session: Option<EchoSession>,
}

pub struct SessionDriver {
    client: Arc<dyn GattClient>,
    correlator: Arc<EventCorrelator>,
    cache: Arc<HandleCache>,
    config: EchoConfig,
    cancel: CancelToken,
    seed: Option<u64>,
}

impl SessionDriver {
    pub fn new(
        client: Arc<dyn GattClient>,
        correlator: Arc<EventCorrelator>,
        cache: Arc<HandleCache>,
        config: EchoConfig,
    ) -> Self {
        Self {
            client,
            correlator,
            cache,
            config,
            cancel: CancelToken::never(),
            seed: None,
        }
    }

    /// Stop the echo loop when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Seed the payload generator.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Run a full session for `trigger` and report the outcome.
    pub async fn run(&self, trigger: &TestTrigger, plan: &EchoPlan) -> SessionReport {
        log::info!("Echo session for {} ({})", trigger.address, trigger.address_type);

        let mut run = SessionRun {
            states: StateLog::default(),
            connection: None,
            session: None,
        };
        run.states.enter(SessionState::Idle);

        let forward = self.forward(&mut run, trigger, plan).await;
        let teardown = self.teardown(&mut run).await;

        let (stats, error) = match (forward, teardown) {
            (Ok(stats), Ok(())) => (Some(stats), None),
            (Ok(stats), Err(e)) => (Some(stats), Some(e)),
            (Err(e), _) => (None, Some(e)),
        };

        let report = SessionReport {
            passed: error.is_none(),
            client_id: run.session.as_ref().map(|s| s.client_id).unwrap_or_else(Uuid::nil),
            peer: trigger.address.to_string(),
            connection_handle: run.connection.as_ref().map(|c| c.connection_handle),
            states: run.states,
            stats,
            error,
        };

        match &report.error {
            None => log::info!("Echo session for {} passed", report.peer),
            Some(e) => log::error!("Echo session for {} failed: {}", report.peer, e),
        }
        report
    }

    async fn forward(
        &self,
        run: &mut SessionRun,
        trigger: &TestTrigger,
        plan: &EchoPlan,
    ) -> Result<EchoStats, EchoError> {
        run.states.enter(SessionState::Connecting);
        let manager = ConnectionManager::new(
            Arc::clone(&self.client),
            Arc::clone(&self.correlator),
            self.config.connection_parameters,
            self.config.param_update_timeout(),
        );
        let info = manager.connect(&trigger.address, trigger.address_type).await?;
        run.connection = Some(info.clone());

        if self.cache.get(&info.peer_address).is_none() {
            run.states.enter(SessionState::Discovering);
        }
        let endpoints = discover_cached(&self.cache, self.client.as_ref(), &info).await?;

        let session = run.session.insert(EchoSession::new(info, endpoints));
        if let Some(mtu) = self.config.mtu {
            session.update_mtu(mtu)?;
        }

        run.states.enter(SessionState::Subscribing);
        SubscriptionController::new(Arc::clone(&self.client))
            .subscribe(session)
            .await?;

        run.states.enter(SessionState::EchoLoop);
        let mut engine = EchoEngine::new(
            Arc::clone(&self.client),
            Arc::clone(&self.correlator),
            self.config.wait_timeout(),
            self.config.pacing(),
        );
        if let Some(seed) = self.seed {
            engine = engine.with_seed(seed);
        }

        match plan {
            EchoPlan::Single(payload) => {
                if payload.is_empty() || payload.len() > session.mtu() {
                    return Err(EchoError::InvalidArgument(format!(
                        "payload of {} bytes outside 1..={}",
                        payload.len(),
                        session.mtu()
                    )));
                }
                engine.echo_once(session, payload).await?;
                Ok(EchoStats {
                    iterations: 1,
                    bytes_echoed: payload.len() as u64,
                    ..Default::default()
                })
            }
            EchoPlan::Timed { duration, min_size } => {
                engine.run_for(session, *duration, *min_size, &self.cancel).await
            }
        }
    }

    /// Best-effort cleanup. Every step runs; the first failure is returned.
    async fn teardown(&self, run: &mut SessionRun) -> Result<(), EchoError> {
        let mut first_error: Option<EchoError> = None;
        let mut note = |result: Result<(), EchoError>| {
            if let Err(e) = result {
                log::warn!("Teardown step failed: {}", e);
                first_error.get_or_insert(e);
            }
        };

        if let Some(session) = run.session.as_mut() {
            if session.subscription != SubscriptionState::Unsubscribed {
                run.states.enter(SessionState::Unsubscribing);
                note(
                    SubscriptionController::new(Arc::clone(&self.client))
                        .unsubscribe(session)
                        .await,
                );
            }
        }

        if let Some(info) = run.connection.as_ref() {
            let handle = info.connection_handle;
            note(
                self.client
                    .disconnect(handle)
                    .await
                    .map_err(|e| EchoError::protocol(GattOperation::Disconnect, Some(handle), e)),
            );
        }
        note(
            self.client
                .reset()
                .await
                .map_err(|e| EchoError::protocol(GattOperation::Reset, None, e)),
        );

        run.states.enter(SessionState::Released);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::{AttUuid, CharacteristicHandle, DescriptorHandle};

    fn session() -> EchoSession {
        let info = ConnectionInfo {
            connection_handle: 2,
            peer_address: PeerAddress([1, 2, 3, 4, 5, 6]),
            address_type: AddressType::Public,
        };
        let characteristic = CharacteristicHandle {
            uuid: AttUuid::Short(0),
            start_handle: 1,
            end_handle: 2,
            value_handle: 2,
        };
        let endpoints = UartEndpoints {
            rx: characteristic.clone(),
            tx: characteristic,
            rx_cccd: DescriptorHandle {
                uuid: AttUuid::Short(0x2902),
                handle: 3,
            },
        };
        EchoSession::new(info, endpoints)
    }

    #[test]
    fn test_mtu_updates_once() {
        let mut session = session();
        assert_eq!(session.mtu(), DEFAULT_MTU);
        session.update_mtu(64).unwrap();
        assert_eq!(session.mtu(), 64);
        assert!(matches!(session.update_mtu(128), Err(EchoError::InvalidState(_))));
        assert_eq!(session.mtu(), 64);
    }

    #[test]
    fn test_zero_mtu_rejected() {
        let mut session = session();
        assert!(matches!(session.update_mtu(0), Err(EchoError::InvalidArgument(_))));
        // A rejected update does not use up the one allowed change.
        session.update_mtu(30).unwrap();
    }

    #[test]
    fn test_parse_trigger() {
        let trigger = TestTrigger::parse("eb:59:b8:48:1d:4d,1").unwrap();
        assert_eq!(trigger.address, PeerAddress([0xEB, 0x59, 0xB8, 0x48, 0x1D, 0x4D]));
        assert_eq!(trigger.address_type, AddressType::Random);

        let anonymous = TestTrigger::parse("EB:59:B8:48:1D:4D, 255").unwrap();
        assert_eq!(anonymous.address_type, AddressType::Anonymous);
    }

    #[test]
    fn test_parse_trigger_rejects_bad_input() {
        for bad in ["eb:59:b8:48:1d:4d", "eb:59:b8:48:1d,0", "eb:59:b8:48:1d:4d,7", "eb:59:b8:48:1d:4d,x"] {
            assert!(
                matches!(TestTrigger::parse(bad), Err(EchoError::InvalidArgument(_))),
                "accepted {}",
                bad
            );
        }
    }

    #[test]
    fn test_report_serializes_error_summary() {
        let report = SessionReport {
            passed: false,
            client_id: Uuid::nil(),
            peer: "01:02:03:04:05:06".into(),
            connection_handle: Some(2),
            states: StateLog(vec![SessionState::Idle, SessionState::Released]),
            stats: None,
            error: Some(EchoError::Mismatch {
                connection_handle: 2,
                sent: "01".into(),
                received: "02".into(),
            }),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["error"]["kind"], "mismatch");
        assert_eq!(json["error"]["connection_handle"], 2);
        assert_eq!(json["states"], serde_json::json!(["Idle", "Released"]));
    }
}
