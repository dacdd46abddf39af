//! Error injection for soft devices.
//!
//! Every soft device checks its [`FaultInjector`] before doing the work of
//! an operation. Operation names are `"GET <field>"`, `"PUT <field>"` and
//! `"open"`. Clones share state, so a test keeps one clone and hands the
//! other to the driver.

use super::rng::SoftRng;
use mx_core::{MxError, MxResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct FaultState {
    pending: HashMap<String, u32>,
    failure_rate: f64,
}

/// Shared, cloneable error-injection switchboard.
#[derive(Debug, Clone)]
pub struct FaultInjector {
    state: Arc<Mutex<FaultState>>,
    rng: Arc<SoftRng>,
}

impl FaultInjector {
    /// No injected errors.
    pub fn none() -> Self {
        Self::seeded(None)
    }

    /// No injected errors; random failures (if enabled later) use `seed`.
    pub fn seeded(seed: Option<u64>) -> Self {
        Self {
            state: Arc::new(Mutex::new(FaultState::default())),
            rng: Arc::new(SoftRng::new(seed)),
        }
    }

    /// Make the next `operation` fail with a device I/O error.
    pub fn fail_next(&self, operation: impl Into<String>) {
        *self.state.lock().pending.entry(operation.into()).or_insert(0) += 1;
    }

    /// Fail every operation with probability `rate`.
    pub fn set_failure_rate(&self, rate: f64) {
        self.state.lock().failure_rate = rate;
    }

    /// Drop all pending failures and the failure rate.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        state.failure_rate = 0.0;
    }

    /// Called by devices before performing `operation`.
    pub fn check(&self, device: &str, operation: &str) -> MxResult<()> {
        let mut state = self.state.lock();
        if let Some(count) = state.pending.get_mut(operation) {
            *count -= 1;
            if *count == 0 {
                state.pending.remove(operation);
            }
            return Err(MxError::DeviceIo(format!(
                "{}: injected failure on '{}'",
                device, operation
            )));
        }
        if self.rng.should_fail(state.failure_rate) {
            return Err(MxError::DeviceIo(format!(
                "{}: random failure on '{}'",
                device, operation
            )));
        }
        Ok(())
    }
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::none()
    }
}
