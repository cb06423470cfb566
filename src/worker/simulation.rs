//! Simulation worker for pools that only need to see share traffic
//!
//! No hashes are computed. Shares are paced by a delay model derived from the
//! configured hash rate and the pool's share difficulty, and carry random
//! nonce material.

use super::{ShareCandidate, ShareWorker, SharedHashRate};
use crate::HashRate;
use rand::Rng;
use std::time::Duration;
use tracing::info;

/// Parameters of the share delay model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShareTiming {
    /// Floor applied to every computed delay
    pub min_interval: Duration,
    /// Delay at difficulty 1 when running at the reference hash rate
    pub base_interval: Duration,
    pub reference_hash_rate: HashRate,
}

impl Default for ShareTiming {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            base_interval: Duration::from_secs(10),
            reference_hash_rate: HashRate::new(1e12),
        }
    }
}

/// Simulation worker that paces shares by hash rate and difficulty
pub struct SimulationWorker {
    hash_rate: SharedHashRate,
    timing: ShareTiming,
}

impl SimulationWorker {
    /// Create a new simulation worker reading its rate from `hash_rate`
    pub fn new(hash_rate: SharedHashRate, timing: ShareTiming) -> Self {
        info!(
            "Creating simulation worker at {} (reference {}, floor {:?})",
            hash_rate.get(),
            timing.reference_hash_rate,
            timing.min_interval
        );

        Self { hash_rate, timing }
    }
}

impl ShareWorker for SimulationWorker {
    fn worker_type(&self) -> &'static str {
        "simulation"
    }

    /// `max(min_interval, base_interval * (reference / configured) * difficulty)`
    fn share_delay(&self, difficulty: f64) -> Duration {
        let ratio = self.timing.reference_hash_rate.value() / self.hash_rate.get().value();
        let seconds = self.timing.base_interval.as_secs_f64() * ratio * difficulty;

        Duration::try_from_secs_f64(seconds)
            .unwrap_or(Duration::MAX)
            .max(self.timing.min_interval)
    }

    fn fabricate(&mut self, extranonce2_size: usize) -> ShareCandidate {
        let mut rng = rand::rng();

        let mut nonce = [0u8; 4];
        rng.fill(&mut nonce[..]);

        let mut extranonce2 = vec![0u8; extranonce2_size];
        rng.fill(&mut extranonce2[..]);

        ShareCandidate {
            nonce: hex::encode(nonce),
            extranonce2: hex::encode(extranonce2),
        }
    }
}
