//! Share workers
//!
//! A worker decides how long the session waits between share submissions and
//! produces the nonce material for each submission. The pool session owns the
//! timer; the worker only supplies numbers.

use crate::{HashRate, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::Span;

pub mod simulation;

pub use simulation::{ShareTiming, SimulationWorker};

/// Nonce material for one share submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareCandidate {
    /// 4 bytes, lowercase hex
    pub nonce: String,
    /// `extranonce2_size` bytes, lowercase hex
    pub extranonce2: String,
}

/// Share worker trait
///
/// Implementations must be cheap to call from inside the connection task;
/// neither method may block.
pub trait ShareWorker: Send + Sync {
    /// Get the worker type name for logging
    fn worker_type(&self) -> &'static str;

    /// Delay before the next share at the given share difficulty
    fn share_delay(&self, difficulty: f64) -> Duration;

    /// Produce nonce material for the current job
    fn fabricate(&mut self, extranonce2_size: usize) -> ShareCandidate;
}

/// Hash rate knob shared between the client handle and its connection task
#[derive(Debug, Clone)]
pub struct SharedHashRate(Arc<RwLock<HashRate>>);

impl SharedHashRate {
    pub fn new(rate: HashRate) -> Result<Self> {
        Ok(Self(Arc::new(RwLock::new(rate.ensure_positive()?))))
    }

    pub fn get(&self) -> HashRate {
        *self.0.read()
    }

    /// Replace the rate; takes effect at the next scheduled share
    pub fn set(&self, rate: HashRate) -> Result<()> {
        *self.0.write() = rate.ensure_positive()?;
        Ok(())
    }
}

/// Create a tracing span for share production
pub fn share_span(worker_type: &str, job_id: &str) -> Span {
    tracing::debug_span!("share", worker_type = worker_type, job_id = job_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_hash_rate() {
        let shared = SharedHashRate::new(HashRate::new(1_000.0)).unwrap();
        let clone = shared.clone();

        clone.set(HashRate::new(5_000.0)).unwrap();
        assert_eq!(shared.get().value(), 5_000.0);

        assert!(shared.set(HashRate::new(0.0)).is_err());
        assert_eq!(shared.get().value(), 5_000.0);
    }

    #[test]
    fn test_shared_hash_rate_rejects_invalid_initial_value() {
        assert!(SharedHashRate::new(HashRate::new(-1.0)).is_err());
    }
}
