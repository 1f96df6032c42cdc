//! Budget tiers.
//!
//! The configured maxima are a *soft* budget: exceeding them is logged and
//! nothing else. At [`HARD_CEILING_FACTOR`] times the budget new spawns are
//! refused, and at [`RUNAWAY_FACTOR`] times the periodic cleanup is allowed to
//! start killing processes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Multiplier of the soft budget at which admission is refused.
pub const HARD_CEILING_FACTOR: f64 = 1.5;

/// Multiplier of the soft budget at which periodic cleanup acts.
pub const RUNAWAY_FACTOR: f64 = 2.0;

/// How far a measurement sits above its budget. Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetTier {
    WithinBudget,
    OverSoftBudget,
    OverHardCeiling,
    Runaway,
}

impl fmt::Display for BudgetTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetTier::WithinBudget => write!(f, "within budget"),
            BudgetTier::OverSoftBudget => write!(f, "over soft budget"),
            BudgetTier::OverHardCeiling => write!(f, "over hard ceiling"),
            BudgetTier::Runaway => write!(f, "runaway"),
        }
    }
}

impl BudgetTier {
    /// Whether new workers may still be admitted at this tier.
    pub fn admits(&self) -> bool {
        *self < BudgetTier::OverHardCeiling
    }
}

/// Soft budget for worker processes on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBudget {
    pub max_processes: usize,
    pub max_memory_mb: u64,
}

impl ResourceBudget {
    pub fn new(max_processes: usize, max_memory_mb: u64) -> Self {
        Self {
            max_processes,
            max_memory_mb,
        }
    }

    pub fn process_tier(&self, process_count: usize) -> BudgetTier {
        tier_for(process_count as f64, self.max_processes as f64)
    }

    pub fn memory_tier(&self, memory_mb: u64) -> BudgetTier {
        tier_for(memory_mb as f64, self.max_memory_mb as f64)
    }

    /// The worse of the two dimensions.
    pub fn classify(&self, process_count: usize, memory_mb: u64) -> BudgetTier {
        self.process_tier(process_count)
            .max(self.memory_tier(memory_mb))
    }
}

fn tier_for(value: f64, budget: f64) -> BudgetTier {
    if value >= budget * RUNAWAY_FACTOR {
        BudgetTier::Runaway
    } else if value >= budget * HARD_CEILING_FACTOR {
        BudgetTier::OverHardCeiling
    } else if value > budget {
        BudgetTier::OverSoftBudget
    } else {
        BudgetTier::WithinBudget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_at_budget_is_within() {
        let budget = ResourceBudget::new(30, 3000);
        assert_eq!(budget.classify(30, 3000), BudgetTier::WithinBudget);
        assert!(budget.classify(30, 3000).admits());
    }

    #[test]
    fn test_soft_budget_still_admits() {
        let budget = ResourceBudget::new(30, 3000);
        assert_eq!(budget.process_tier(44), BudgetTier::OverSoftBudget);
        assert!(budget.process_tier(44).admits());
        assert_eq!(budget.memory_tier(4499), BudgetTier::OverSoftBudget);
    }

    #[test]
    fn test_hard_ceiling_blocks() {
        let budget = ResourceBudget::new(30, 3000);
        assert_eq!(budget.process_tier(45), BudgetTier::OverHardCeiling);
        assert!(!budget.process_tier(45).admits());
        assert_eq!(budget.memory_tier(4500), BudgetTier::OverHardCeiling);

        // Fractional ceiling: 1.5 * 2 = 3
        let small = ResourceBudget::new(2, 100);
        assert!(small.process_tier(2).admits());
        assert!(!small.process_tier(3).admits());
    }

    #[test]
    fn test_runaway_and_worst_dimension_wins() {
        let budget = ResourceBudget::new(10, 1000);
        assert_eq!(budget.process_tier(20), BudgetTier::Runaway);
        assert_eq!(budget.classify(1, 2500), BudgetTier::Runaway);
        assert_eq!(budget.classify(12, 100), BudgetTier::OverSoftBudget);
    }
}
