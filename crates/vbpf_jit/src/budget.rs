use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::warn;

use crate::{JitError, Result};

/// Charges executable memory held by JIT images against a global limit.
pub struct JitBudget {
    used: AtomicUsize,
    limit: usize,
    pressure_threshold: f64,
}

impl JitBudget {
    /// `limit == 0` disables the limit.
    pub fn new(limit: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            limit,
            pressure_threshold: 0.8, // 80% of the limit is reported as pressure
        }
    }

    pub fn charge(&self, bytes: usize) -> Result<()> {
        if self.limit == 0 {
            self.used.fetch_add(bytes, Ordering::Relaxed);
            return Ok(());
        }

        let limit = self.limit;
        let previous = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&next| next <= limit)
            })
            .map_err(|used| JitError::BudgetExceeded {
                requested: bytes,
                used,
                limit,
            })?;

        if !self.detect_pressure(previous) && self.detect_pressure(previous + bytes) {
            warn!(used = previous + bytes, limit, "JIT memory budget under pressure");
        }
        Ok(())
    }

    pub fn uncharge(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    #[inline]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    fn detect_pressure(&self, usage: usize) -> bool {
        if self.limit == 0 {
            return false;
        }
        (usage as f64 / self.limit as f64) >= self.pressure_threshold
    }
}

impl Default for JitBudget {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_budget() {
        let budget = JitBudget::default();
        budget.charge(1 << 40).unwrap();
        assert_eq!(budget.used(), 1 << 40);
    }

    #[test]
    fn test_limit_enforced_and_released() {
        let budget = JitBudget::new(256);
        budget.charge(192).unwrap();
        assert!(matches!(
            budget.charge(128),
            Err(JitError::BudgetExceeded {
                requested: 128,
                used: 192,
                limit: 256
            })
        ));
        budget.uncharge(192);
        budget.charge(256).unwrap();
        assert_eq!(budget.used(), 256);
    }
}
