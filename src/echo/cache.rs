//! Discovered handle cache
//!
//! The GATT layout of a device under test does not change between
//! connections, so discovery runs once per peer and every later session
//! reuses the result. Each peer gets a one-shot cell: the first session to
//! populate it wins, concurrent first discoveries wait on the same
//! initializer, and a populated entry is never overwritten.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::ble::gatt::UartEndpoints;
use crate::ble::transport::PeerAddress;

#[derive(Default)]
pub struct HandleCache {
    entries: Mutex<HashMap<PeerAddress, Arc<OnceCell<UartEndpoints>>>>,
}

impl HandleCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn cell(&self, peer: &PeerAddress) -> Arc<OnceCell<UartEndpoints>> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(entries.entry(*peer).or_default())
    }

    /// Cached endpoints for `peer`, if discovery already succeeded.
    pub fn get(&self, peer: &PeerAddress) -> Option<UartEndpoints> {
        self.cell(peer).get().cloned()
    }

    /// Return the cached endpoints for `peer`, running `discover` only if
    /// none are cached yet.
    ///
    /// A failed discovery leaves the entry empty so a later session can try
    /// again; it does not poison the cache.
    pub async fn get_or_discover<F, Fut, E>(
        &self,
        peer: &PeerAddress,
        discover: F,
    ) -> Result<UartEndpoints, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<UartEndpoints, E>>,
    {
        let cell = self.cell(peer);
        if let Some(endpoints) = cell.get() {
            log::debug!("Using cached UART handles for {}", peer);
            return Ok(endpoints.clone());
        }
        let endpoints = cell.get_or_try_init(discover).await?;
        Ok(endpoints.clone())
    }

    /// Number of peers with populated entries.
    pub fn len(&self) -> usize {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.values().filter(|cell| cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
