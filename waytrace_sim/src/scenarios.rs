//! Timeline scenarios for deterministic simulation testing.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// TLP-001: brief speed spike inside a walk must not split the path
    ModeShiftNoise,

    /// TLP-002: stationary dwell then departure becomes Visit → Path
    VisitThenWalk,

    /// TLP-003: sub-keeper stationary blip mid-walk is swallowed
    NoiseVisitSwallowed,

    /// TLP-004: weak visit bridged away between two strong paths
    BridgeMerge,

    /// TLP-005: an overnight data gap survives processing untouched
    DataGapPreserved,

    /// TLP-006: safe-deleting a visit knits its neighbour paths together
    SafeDeleteMiddle,

    /// TLP-007: a full day of dwells, walks and rides stays consistent
    CityDay,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::ModeShiftNoise,
            ScenarioId::VisitThenWalk,
            ScenarioId::NoiseVisitSwallowed,
            ScenarioId::BridgeMerge,
            ScenarioId::DataGapPreserved,
            ScenarioId::SafeDeleteMiddle,
            ScenarioId::CityDay,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::ModeShiftNoise => "mode_shift_noise",
            ScenarioId::VisitThenWalk => "visit_then_walk",
            ScenarioId::NoiseVisitSwallowed => "noise_visit_swallowed",
            ScenarioId::BridgeMerge => "bridge_merge",
            ScenarioId::DataGapPreserved => "data_gap_preserved",
            ScenarioId::SafeDeleteMiddle => "safe_delete_middle",
            ScenarioId::CityDay => "city_day",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::ModeShiftNoise => {
                "3 s at 9 km/h inside a 4 km/h walk; one walking path must survive"
            }
            ScenarioId::VisitThenWalk => {
                "5 min stationary then 2 min walking; exactly Visit → Path, linked"
            }
            ScenarioId::NoiseVisitSwallowed => {
                "8 s stationary blip between walks of the same type; one path remains"
            }
            ScenarioId::BridgeMerge => {
                "keeper paths either side of a weak visit; bridge merge kills both middles"
            }
            ScenarioId::DataGapPreserved => {
                "13 h recording outage between keeper visits; the gap item survives"
            }
            ScenarioId::SafeDeleteMiddle => {
                "safe-delete a keeper visit between same-type paths; one path spans"
            }
            ScenarioId::CityDay => {
                "dwell/walk/ride composite day; invariants and alternation hold throughout"
            }
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
            "mode_shift_noise" | "modeshiftnoise" | "tlp-001" => Ok(ScenarioId::ModeShiftNoise),
            "visit_then_walk" | "visitthenwalk" | "tlp-002" => Ok(ScenarioId::VisitThenWalk),
            "noise_visit_swallowed" | "noisevisitswallowed" | "tlp-003" => {
                Ok(ScenarioId::NoiseVisitSwallowed)
            }
            "bridge_merge" | "bridgemerge" | "tlp-004" => Ok(ScenarioId::BridgeMerge),
            "data_gap_preserved" | "datagappreserved" | "tlp-005" => {
                Ok(ScenarioId::DataGapPreserved)
            }
            "safe_delete_middle" | "safedeletemiddle" | "tlp-006" => {
                Ok(ScenarioId::SafeDeleteMiddle)
            }
            "city_day" | "cityday" | "tlp-007" => Ok(ScenarioId::CityDay),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
