//! Agent selection strategies.
//!
//! A strategy only ranks candidates. Filtering for eligibility (offline,
//! capacity, capability) happens in the registry before a strategy is asked,
//! and candidates always arrive in registration order.

use crate::types::Agent;
use agentfarm_core::FarmError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Named selection strategy, as it appears in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastBusy,
    Priority,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round-robin",
            Strategy::LeastBusy => "least-busy",
            Strategy::Priority => "priority",
        }
    }

    /// Build the selector implementing this strategy.
    pub fn selector(&self) -> Box<dyn AgentSelector> {
        match self {
            Strategy::RoundRobin => Box::new(RoundRobinSelector::new()),
            Strategy::LeastBusy => Box::new(LeastBusySelector),
            Strategy::Priority => Box::new(PrioritySelector),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = FarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(Strategy::RoundRobin),
            "least-busy" => Ok(Strategy::LeastBusy),
            "priority" => Ok(Strategy::Priority),
            other => Err(FarmError::Config(format!(
                "unknown strategy '{other}' (expected round-robin, least-busy or priority)"
            ))),
        }
    }
}

/// Picks one agent out of a non-empty, registration-ordered candidate list.
pub trait AgentSelector: Send + Sync {
    fn select<'a>(&self, candidates: &[&'a Agent]) -> Option<&'a Agent>;

    fn name(&self) -> &str;
}

/// Cycles through agents in registration order.
///
/// Remembers the registration order of the last pick rather than an index, so
/// agents joining or leaving do not shift the rotation.
pub struct RoundRobinSelector {
    last: AtomicU64,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }
}

impl Default for RoundRobinSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentSelector for RoundRobinSelector {
    fn select<'a>(&self, candidates: &[&'a Agent]) -> Option<&'a Agent> {
        let last = self.last.load(Ordering::Relaxed);
        let picked = candidates
            .iter()
            .find(|a| a.registration_order > last)
            .or_else(|| candidates.first())
            .copied()?;
        self.last.store(picked.registration_order, Ordering::Relaxed);
        Some(picked)
    }

    fn name(&self) -> &str {
        "round-robin"
    }
}

/// Fewest completed plus in-flight tasks; earliest registration on ties.
pub struct LeastBusySelector;

impl AgentSelector for LeastBusySelector {
    fn select<'a>(&self, candidates: &[&'a Agent]) -> Option<&'a Agent> {
        // min_by_key keeps the first minimum, which is the earliest registered
        candidates.iter().copied().min_by_key(|a| a.busyness())
    }

    fn name(&self) -> &str {
        "least-busy"
    }
}

/// Lowest platform priority value, then least busy, then earliest registration.
pub struct PrioritySelector;

impl AgentSelector for PrioritySelector {
    fn select<'a>(&self, candidates: &[&'a Agent]) -> Option<&'a Agent> {
        candidates
            .iter()
            .copied()
            .min_by_key(|a| (a.priority, a.busyness()))
    }

    fn name(&self) -> &str {
        "priority"
    }
}

/// Apply the preferred-agent hint before falling back to the selector.
///
/// An eligible preferred agent always wins. An ineligible or unknown one is
/// ignored.
pub fn choose<'a>(
    selector: &dyn AgentSelector,
    candidates: &[&'a Agent],
    preferred: Option<&str>,
) -> Option<&'a Agent> {
    if let Some(wanted) = preferred {
        if let Some(agent) = candidates.iter().find(|a| a.id == wanted) {
            return Some(agent);
        }
    }
    selector.select(candidates)
}
