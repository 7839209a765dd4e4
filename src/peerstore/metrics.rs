//! Per-peer latency metrics.
//!
//! A single exponentially weighted moving average per peer, smoothing
//! factor 0.1: one slow round trip nudges the estimate, it does not own it.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::identity::PeerId;

/// EWMA smoothing factor
const LATENCY_EWMA_SMOOTHING: f64 = 0.1;

/// Latency EWMA per peer
#[derive(Debug, Default)]
pub struct Metrics {
    latency: Mutex<HashMap<PeerId, f64>>,
}

impl Metrics {
    pub(crate) fn new() -> Metrics {
        Metrics::default()
    }

    /// Fold one measured round trip into the peer's EWMA
    pub fn record_latency(&self, peer: &PeerId, rtt: Duration) {
        let sample = rtt.as_nanos() as f64;
        let mut latency = self.latency.lock();
        latency
            .entry(*peer)
            .and_modify(|ewma| {
                *ewma = *ewma * (1.0 - LATENCY_EWMA_SMOOTHING) + sample * LATENCY_EWMA_SMOOTHING
            })
            .or_insert(sample);
    }

    /// Current latency estimate for `peer`
    pub fn latency(&self, peer: &PeerId) -> Option<Duration> {
        self.latency
            .lock()
            .get(peer)
            .map(|ns| Duration::from_nanos(*ns as u64))
    }

    /// Forget a peer's metrics
    pub fn clear(&self, peer: &PeerId) {
        self.latency.lock().remove(peer);
    }
}
