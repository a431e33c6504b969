//! Owner Quotas
//!
//! Each owner may submit up to `max` jobs before being refused. Usage
//! drains once per minute by `1 + max / (24 * 60)`, so a full budget comes
//! back within a day.

use crate::error::CoordinationError;

use dashmap::DashMap;

pub struct QuotaLedger {
    /// Usage cap per owner; 0 disables quotas.
    max: u64,
    usage: DashMap<String, u64>,
}

impl QuotaLedger {
    pub fn new(max: u64) -> Self {
        Self {
            max,
            usage: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max > 0
    }

    /// Counts one job against `owner`, refusing it when the owner is at the cap.
    pub fn charge(&self, owner: &str) -> Result<(), CoordinationError> {
        if !self.is_enabled() {
            return Ok(());
        }

        let mut used = self.usage.entry(owner.to_string()).or_insert(0);
        if *used >= self.max {
            return Err(CoordinationError::QuotaExceeded {
                owner: owner.to_string(),
                used: *used,
                limit: self.max,
            });
        }

        *used += 1;
        Ok(())
    }

    /// Takes back one charge of a submission that was never stored.
    pub fn refund(&self, owner: &str) {
        self.usage.remove_if_mut(owner, |_, used| {
            *used = used.saturating_sub(1);
            *used == 0
        });
    }

    pub fn usage(&self, owner: &str) -> u64 {
        self.usage.get(owner).map(|used| *used).unwrap_or(0)
    }

    /// One minute's worth of refill.
    pub fn decay_step(&self) -> u64 {
        1 + self.max / (24 * 60)
    }

    /// Lowers every owner's usage by one step; owners back at zero are dropped.
    pub fn decay(&self) {
        let step = self.decay_step();
        self.usage.retain(|_, used| {
            *used = used.saturating_sub(step);
            *used > 0
        });
        tracing::debug!("Decayed quotas by {} ({} owners still charged)", step, self.usage.len());
    }
}
