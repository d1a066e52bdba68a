//! Event correlation over the shared device event stream
//!
//! The device under test reports everything on one ordered stream. A wait
//! pops events until one satisfies its predicate; events that do not match
//! are dropped rather than requeued, so only one session may wait on a
//! stream at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use super::EchoError;
use crate::ble::events::DeviceEvent;
use crate::ble::transport::ConnectionHandle;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error("No matching event within {0:?}")]
    Timeout(Duration),

    #[error("Device event stream closed")]
    Closed,
}

impl WaitError {
    /// Attach the waiting context to produce a session-level error.
    pub fn into_echo_error(
        self,
        waiting_for: &'static str,
        connection_handle: Option<ConnectionHandle>,
    ) -> EchoError {
        match self {
            WaitError::Timeout(after) => EchoError::Timeout {
                waiting_for,
                connection_handle,
                after,
            },
            WaitError::Closed => EchoError::EventStreamClosed,
        }
    }
}

pub struct EventCorrelator {
    events: Mutex<mpsc::Receiver<DeviceEvent>>,
    dropped: AtomicU64,
}

impl EventCorrelator {
    pub fn new(events: mpsc::Receiver<DeviceEvent>) -> Self {
        Self {
            events: Mutex::new(events),
            dropped: AtomicU64::new(0),
        }
    }

    /// Block until an event satisfying `predicate` arrives, or `timeout` elapses.
    ///
    /// The bound covers the whole wait, including time spent queued behind
    /// another waiter.
    pub async fn wait_for<P>(&self, predicate: P, timeout: Duration) -> Result<DeviceEvent, WaitError>
    where
        P: Fn(&DeviceEvent) -> bool,
    {
        let deadline = Instant::now() + timeout;

        let mut events = tokio::time::timeout_at(deadline, self.events.lock())
            .await
            .map_err(|_| WaitError::Timeout(timeout))?;

        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) => return Err(WaitError::Timeout(timeout)),
                Ok(None) => return Err(WaitError::Closed),
                Ok(Some(event)) if predicate(&event) => return Ok(event),
                Ok(Some(event)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Dropping unmatched {} event: {:?}", event.kind(), event);
                }
            }
        }
    }

    /// Events discarded because they did not match the wait in progress.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
