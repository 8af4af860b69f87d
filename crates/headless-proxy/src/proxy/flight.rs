//! Coalescing of identical concurrent renders.
//!
//! Requests sharing a cache fingerprint pass one gate at a time. The first
//! miss renders and stores while the rest queue on the gate; by the time they
//! get through, the cache answers them.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Gate = Arc<AsyncMutex<()>>;

#[derive(Default)]
pub struct RenderFlights {
    gates: Mutex<HashMap<String, Gate>>,
}

impl RenderFlights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the gate of `key`.
    ///
    /// Returns `None` when the gate stayed busy for `max_wait`; the caller then
    /// proceeds on its own instead of queueing behind a stuck render.
    pub async fn enter(&self, key: String, max_wait: Duration) -> Option<FlightPass<'_>> {
        let gate = self.gates.lock().entry(key.clone()).or_default().clone();
        match tokio::time::timeout(max_wait, gate.clone().lock_owned()).await {
            Ok(guard) => Some(FlightPass {
                flights: self,
                key,
                gate: Some(gate),
                guard: Some(guard),
            }),
            Err(_) => {
                self.leave(&key, gate);
                None
            }
        }
    }

    /// Keys with a render in flight or queued.
    pub fn in_flight(&self) -> usize {
        self.gates.lock().len()
    }

    fn leave(&self, key: &str, gate: Gate) {
        let mut gates = self.gates.lock();
        drop(gate);
        if gates.get(key).is_some_and(|g| Arc::strong_count(g) == 1) {
            gates.remove(key);
        }
    }
}

/// Held while a request owns the gate of its fingerprint.
pub struct FlightPass<'a> {
    flights: &'a RenderFlights,
    key: String,
    gate: Option<Gate>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FlightPass<'_> {
    fn drop(&mut self) {
        self.guard.take();
        if let Some(gate) = self.gate.take() {
            self.flights.leave(&self.key, gate);
        }
    }
}
