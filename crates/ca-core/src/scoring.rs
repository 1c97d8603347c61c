use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::{Finding, ThreatLevel};
use crate::paths;

/// Score tier labels and colors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScoreTier {
    pub label: &'static str,
    pub color: &'static str,
}

/// Get the tier for a given score.
pub fn get_score_tier(score: u32) -> ScoreTier {
    match score {
        90..=100 => ScoreTier {
            label: "Excellent",
            color: "green",
        },
        70..=89 => ScoreTier {
            label: "Good",
            color: "blue",
        },
        50..=69 => ScoreTier {
            label: "Moderate",
            color: "yellow",
        },
        30..=49 => ScoreTier {
            label: "Poor",
            color: "dark_orange",
        },
        _ => ScoreTier {
            label: "Critical",
            color: "red",
        },
    }
}

pub type ThreatWeights = HashMap<ThreatLevel, u32>;

fn default_threat_weights() -> ThreatWeights {
    HashMap::from([
        (ThreatLevel::Critical, 15),
        (ThreatLevel::High, 10),
        (ThreatLevel::Medium, 6),
        (ThreatLevel::Low, 3),
        (ThreatLevel::Info, 0),
    ])
}

fn parse_threat_weights(yaml: &str) -> Option<ThreatWeights> {
    #[derive(Deserialize)]
    struct WeightsFile {
        threat_weights: HashMap<ThreatLevel, u32>,
    }
    let file = serde_yaml::from_str::<WeightsFile>(yaml).ok()?;
    let mut weights = default_threat_weights();
    weights.extend(file.threat_weights);
    Some(weights)
}

/// Threat weight penalties from shared/schema/threat_weights.yaml, or the
/// built-in table when the file is missing or malformed.
pub fn load_threat_weights() -> ThreatWeights {
    paths::load_shared_yaml("schema/threat_weights.yaml")
        .and_then(|yaml| parse_threat_weights(&yaml))
        .unwrap_or_else(default_threat_weights)
}

/// Privacy score: 100 minus one penalty per finding, clamped to 0..=100.
pub fn compute_score(findings: &[Finding], weights: &ThreatWeights) -> u32 {
    let penalty: i64 = findings
        .iter()
        .map(|f| i64::from(weights.get(&f.threat_level).copied().unwrap_or(5)))
        .sum();
    (100 - penalty).clamp(0, 100) as u32
}
