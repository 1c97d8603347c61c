//! Per-stage consent checklist, findings and verdict.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::{AuditEvent, Finding, Stage, ThreatLevel};
use crate::report::ReportCmp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Warn,
    Fail,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Warn => "warn",
            Self::Fail => "fail",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorCount {
    pub name: String,
    pub key: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub pass: bool,
    pub third_party_requests: usize,
    pub vendors: Vec<VendorCount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leaking_vendors: Option<Vec<VendorCount>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PopupResult {
    pub pass: bool,
    pub cmp: String,
    pub self_test_failed: bool,
    pub appeared_at_ms: u64,
    pub handled_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerSummary {
    pub name: String,
    pub key: String,
    #[serde(rename = "type")]
    pub tracker_type: String,
    pub pre_consent: usize,
    pub after_opt_out: usize,
    pub after_opt_in: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackersResult {
    pub unique_providers: usize,
    pub summary: Vec<TrackerSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecklistStages {
    pub pre_consent: StageResult,
    pub popup: PopupResult,
    pub after_opt_out: StageResult,
    pub after_opt_in: StageResult,
    pub trackers: TrackersResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checklist {
    pub url: String,
    pub locale: String,
    pub stages: ChecklistStages,
    pub findings: Vec<Finding>,
    pub verdict: Verdict,
    pub notes: Vec<String>,
}

/// Everything the checklist looks at.
pub struct ChecklistInput<'a> {
    pub url: &'a str,
    pub locale: &'a str,
    pub events: &'a [AuditEvent],
    pub cmps: &'a [ReportCmp],
    /// Session failures, already formatted for display.
    pub session_errors: &'a [String],
    /// Whether the opt-out session performed a consent action.
    pub opt_out_acted: bool,
}

/// Count events per provider, most frequent first. Ties keep first-seen order.
pub fn count_vendors<'a, I>(events: I) -> Vec<VendorCount>
where
    I: IntoIterator<Item = &'a AuditEvent>,
{
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut counts: Vec<VendorCount> = Vec::new();
    for event in events {
        match index.get(event.provider.key.as_str()) {
            Some(&i) => counts[i].count += 1,
            None => {
                index.insert(event.provider.key.as_str(), counts.len());
                counts.push(VendorCount {
                    name: event.provider.name.clone(),
                    key: event.provider.key.clone(),
                    count: 1,
                });
            }
        }
    }
    counts.sort_by(|a, b| b.count.cmp(&a.count));
    counts
}

/// Per-provider stage counts, sorted by provider name.
pub fn tracker_summary(events: &[AuditEvent]) -> Vec<TrackerSummary> {
    let mut by_key: HashMap<&str, TrackerSummary> = HashMap::new();
    for event in events {
        let entry = by_key
            .entry(event.provider.key.as_str())
            .or_insert_with(|| TrackerSummary {
                name: event.provider.name.clone(),
                key: event.provider.key.clone(),
                tracker_type: event.provider.provider_type.clone(),
                pre_consent: 0,
                after_opt_out: 0,
                after_opt_in: 0,
            });
        if event.stages.pre_consent {
            entry.pre_consent += 1;
        }
        if event.stages.after_opt_out {
            entry.after_opt_out += 1;
        }
        if event.stages.after_opt_in {
            entry.after_opt_in += 1;
        }
    }
    let mut summary: Vec<TrackerSummary> = by_key.into_values().collect();
    summary.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.key.cmp(&b.key)));
    summary
}

fn stage_events(events: &[AuditEvent], stage: Stage) -> Vec<&AuditEvent> {
    events.iter().filter(|e| e.stages.contains(stage)).collect()
}

fn vendor_names(vendors: &[VendorCount]) -> String {
    vendors
        .iter()
        .map(|v| v.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn findings(
    pre_consent: &[VendorCount],
    leaking: &[VendorCount],
    cmps: &[ReportCmp],
    opt_out_acted: bool,
) -> Vec<Finding> {
    let mut out = Vec::new();

    if !leaking.is_empty() {
        out.push(Finding {
            title: "Data shared after opt-out".to_string(),
            description: format!(
                "{} vendor(s) kept receiving data after consent was refused: {}.",
                leaking.len(),
                vendor_names(leaking)
            ),
            threat_level: ThreatLevel::Critical,
            remediation: "Gate these tags on the consent state and confirm the reject path \
                          updates the tag manager's consent mode."
                .to_string(),
        });
    }

    if !pre_consent.is_empty() {
        out.push(Finding {
            title: "Trackers fire before consent".to_string(),
            description: format!(
                "{} vendor(s) received data before any consent choice: {}.",
                pre_consent.len(),
                vendor_names(pre_consent)
            ),
            threat_level: ThreatLevel::High,
            remediation: "Defer non-essential tags until the visitor opts in.".to_string(),
        });
    }

    match cmps.first() {
        None => out.push(Finding {
            title: "No consent dialog detected".to_string(),
            description: "No consent-management platform was recognized on the page.".to_string(),
            threat_level: ThreatLevel::Medium,
            remediation: "Show a consent dialog offering accept and reject options before \
                          setting non-essential trackers."
                .to_string(),
        }),
        Some(cmp) => {
            if cmps.iter().any(|c| c.self_test_fail) {
                out.push(Finding {
                    title: "Consent choice not persisted".to_string(),
                    description: format!(
                        "The {} self-test reported that the stored choice does not match \
                         the action taken.",
                        cmp.name
                    ),
                    threat_level: ThreatLevel::Medium,
                    remediation: "Check that the CMP stores and re-applies the visitor's choice."
                        .to_string(),
                });
            }
            if !opt_out_acted {
                out.push(Finding {
                    title: "Reject action could not be performed".to_string(),
                    description: format!(
                        "{} was detected but the opt-out action was never confirmed.",
                        cmp.name
                    ),
                    threat_level: ThreatLevel::Low,
                    remediation: "Offer a reject option on the first layer of the dialog."
                        .to_string(),
                });
            }
        }
    }

    out
}

/// `fail` on any leak or critical/high finding, `warn` on medium/low
/// findings or a failed session, `pass` otherwise.
pub fn compute_verdict(findings: &[Finding], leaks: usize, session_failed: bool) -> Verdict {
    let severe = findings
        .iter()
        .any(|f| matches!(f.threat_level, ThreatLevel::Critical | ThreatLevel::High));
    if leaks > 0 || severe {
        return Verdict::Fail;
    }
    let minor = findings
        .iter()
        .any(|f| matches!(f.threat_level, ThreatLevel::Medium | ThreatLevel::Low));
    if minor || session_failed {
        Verdict::Warn
    } else {
        Verdict::Pass
    }
}

pub fn build_checklist(input: &ChecklistInput<'_>) -> Checklist {
    let pre = stage_events(input.events, Stage::PreConsent);
    let after_out = stage_events(input.events, Stage::AfterOptOut);
    let after_in = stage_events(input.events, Stage::AfterOptIn);

    let pre_vendors = count_vendors(pre.iter().copied());
    let leaking = count_vendors(after_out.iter().copied());
    let in_vendors = count_vendors(after_in.iter().copied());

    let findings = findings(&pre_vendors, &leaking, input.cmps, input.opt_out_acted);
    let leaks = input.events.iter().filter(|e| e.leak).count();
    let verdict = compute_verdict(&findings, leaks, !input.session_errors.is_empty());

    let mut notes: Vec<String> = input.session_errors.to_vec();
    if !input.opt_out_acted && !input.cmps.is_empty() {
        notes.push(
            "No opt-out action was recorded; every opt-out request is counted as pre-consent."
                .to_string(),
        );
    }

    let popup = match input.cmps.first() {
        Some(cmp) => PopupResult {
            pass: true,
            cmp: cmp.name.clone(),
            self_test_failed: input.cmps.iter().any(|c| c.self_test_fail),
            appeared_at_ms: cmp.detected_at_ms,
            handled_at_ms: cmp.handled_at_ms,
        },
        None => PopupResult {
            pass: false,
            cmp: "Unknown".to_string(),
            self_test_failed: false,
            appeared_at_ms: 0,
            handled_at_ms: 0,
        },
    };

    let summary = tracker_summary(input.events);

    Checklist {
        url: input.url.to_string(),
        locale: input.locale.to_string(),
        stages: ChecklistStages {
            pre_consent: StageResult {
                pass: pre.is_empty(),
                third_party_requests: pre.len(),
                vendors: pre_vendors,
                leaking_vendors: None,
            },
            popup,
            after_opt_out: StageResult {
                pass: after_out.is_empty(),
                third_party_requests: after_out.len(),
                vendors: leaking.clone(),
                leaking_vendors: Some(leaking),
            },
            after_opt_in: StageResult {
                pass: true,
                third_party_requests: after_in.len(),
                vendors: in_vendors,
                leaking_vendors: None,
            },
            trackers: TrackersResult {
                unique_providers: summary.len(),
                summary,
            },
        },
        findings,
        verdict,
        notes,
    }
}
