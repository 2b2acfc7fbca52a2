//! Deterministic simulation scenarios.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// DST-001: Random add/remove/destroy churn across collections
    Churn,

    /// DST-002: Repeated purging batch syncs
    PurgeSync,

    /// DST-003: Add/remove of the same record inside one tick
    Coalesce,

    /// DST-004: Collections adopting records from the store
    Adoption,

    /// DST-005: Collection and store teardown
    Teardown,

    /// DST-006: Channel flush order under shuffled enqueues
    FlushOrder,

    /// DST-007: Serialize, parse and re-add a collection
    RoundTrip,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Churn,
            ScenarioId::PurgeSync,
            ScenarioId::Coalesce,
            ScenarioId::Adoption,
            ScenarioId::Teardown,
            ScenarioId::FlushOrder,
            ScenarioId::RoundTrip,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Churn => "churn",
            ScenarioId::PurgeSync => "purge_sync",
            ScenarioId::Coalesce => "coalesce",
            ScenarioId::Adoption => "adoption",
            ScenarioId::Teardown => "teardown",
            ScenarioId::FlushOrder => "flush_order",
            ScenarioId::RoundTrip => "round_trip",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Churn => "Random adds, removes and destroys checked against the model every op",
            ScenarioId::PurgeSync => "Purging batch syncs, length notifications must stay contiguous",
            ScenarioId::Coalesce => "Same-tick add/remove pairs collapse to the last membership op",
            ScenarioId::Adoption => "Collections share store records instead of duplicating them",
            ScenarioId::Teardown => "Destroyed collections release or preserve owned records",
            ScenarioId::FlushOrder => "Jobs run channel by channel, FIFO within each channel",
            ScenarioId::RoundTrip => "to_json → parse → add reproduces the same raw records",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "churn" | "dst-001" => Ok(ScenarioId::Churn),
            "purge_sync" | "purgesync" | "purge" | "dst-002" => Ok(ScenarioId::PurgeSync),
            "coalesce" | "dst-003" => Ok(ScenarioId::Coalesce),
            "adoption" | "adopt" | "dst-004" => Ok(ScenarioId::Adoption),
            "teardown" | "dst-005" => Ok(ScenarioId::Teardown),
            "flush_order" | "flushorder" | "dst-006" => Ok(ScenarioId::FlushOrder),
            "round_trip" | "roundtrip" | "dst-007" => Ok(ScenarioId::RoundTrip),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
