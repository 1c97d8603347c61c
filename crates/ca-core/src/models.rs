use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity level for an audit finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl ThreatLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Info => "info",
        }
    }
}

impl std::fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single issue raised by the checklist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub title: String,
    pub description: String,
    pub threat_level: ThreatLevel,
    pub remediation: String,
}

/// Consent action a crawl session performs on the dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConsentMode {
    OptIn,
    OptOut,
}

impl ConsentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OptIn => "optIn",
            Self::OptOut => "optOut",
        }
    }

    /// Stage assigned to requests observed after this mode's action.
    pub fn post_action_stage(&self) -> Stage {
        match self {
            Self::OptIn => Stage::AfterOptIn,
            Self::OptOut => Stage::AfterOptOut,
        }
    }
}

impl std::fmt::Display for ConsentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consent phase during which a request was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    PreConsent,
    AfterOptOut,
    AfterOptIn,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreConsent => "preConsent",
            Self::AfterOptOut => "afterOptOut",
            Self::AfterOptIn => "afterOptIn",
        }
    }
}

/// Set of stages an event was seen in. Bits are only ever added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSet {
    pub pre_consent: bool,
    pub after_opt_out: bool,
    pub after_opt_in: bool,
}

impl StageSet {
    pub fn insert(&mut self, stage: Stage) {
        match stage {
            Stage::PreConsent => self.pre_consent = true,
            Stage::AfterOptOut => self.after_opt_out = true,
            Stage::AfterOptIn => self.after_opt_in = true,
        }
    }

    pub fn contains(&self, stage: Stage) -> bool {
        match stage {
            Stage::PreConsent => self.pre_consent,
            Stage::AfterOptOut => self.after_opt_out,
            Stage::AfterOptIn => self.after_opt_in,
        }
    }
}

/// A network response captured on a page during a crawl.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub status: Option<i64>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    /// Wall-clock epoch milliseconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_data: Option<String>,
}

/// One named value a provider extracted from a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionField {
    pub key: String,
    #[serde(default)]
    pub display_field: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub hidden: Option<bool>,
    pub value: serde_json::Value,
}

/// Display group declared by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderGroup {
    pub key: String,
    pub name: String,
}

/// A tracker match produced by the provider catalog for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerDetection {
    pub provider_key: String,
    pub provider_name: String,
    pub provider_type: String,
    pub url: String,
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
    #[serde(default)]
    pub groups: Vec<ProviderGroup>,
    #[serde(default)]
    pub fields: Vec<DetectionField>,
}

/// A request paired with the stage it was classified into.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedRequest {
    pub request: RequestRecord,
    pub stage: Stage,
}

/// A detection tagged with its stage and the request that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedDetection {
    pub detection: TrackerDetection,
    pub stage: Stage,
    pub request: RequestRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub name: String,
    pub key: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    pub columns: BTreeMap<String, String>,
    pub groups: Vec<ProviderGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDataItem {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub value: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hidden: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummary {
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    pub query_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSummary {
    pub status: i64,
    pub mime: String,
    pub size_b: u64,
}

/// One distinct tracking event across both crawl sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: String,
    pub hash: String,
    pub event: String,
    /// First-seen timestamp (epoch ms).
    pub timestamp: i64,
    /// Stage of the first-seen detection.
    pub stage: Stage,
    pub stages: StageSet,
    pub seen_in_opt_in: bool,
    pub seen_in_opt_out: bool,
    pub leak: bool,
    pub third_party: bool,
    pub resource_type: String,
    pub request: RequestSummary,
    pub response: ResponseSummary,
    pub provider: ProviderInfo,
    pub data: Vec<EventDataItem>,
}

/// Distinct provider appearing in at least one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracker {
    pub name: String,
    pub key: String,
    #[serde(rename = "type")]
    pub tracker_type: String,
}

/// Consent-management platform seen by the popup collector in one tab.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmpInfo {
    pub name: String,
    #[serde(rename = "final")]
    pub is_final: bool,
    pub open: bool,
    pub started: bool,
    pub succeeded: bool,
    pub self_test_fail: bool,
    pub errors: Vec<String>,
    pub patterns: Vec<String>,
    pub snippets: Vec<String>,
    pub filter_list_matched: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonData {
    pub text: String,
    pub selector: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopupData {
    pub text: String,
    pub selector: String,
    #[serde(default)]
    pub buttons: Vec<ButtonData>,
}

/// Visible DOM content captured from one frame before any consent action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapedFrame {
    pub is_top: bool,
    pub origin: String,
    #[serde(default)]
    pub cleaned_text: String,
    #[serde(default)]
    pub buttons: Vec<ButtonData>,
    #[serde(default)]
    pub potential_popups: Vec<PopupData>,
}

impl ScrapedFrame {
    /// Whether the frame carries anything worth reporting.
    pub fn has_content(&self) -> bool {
        !self.cleaned_text.is_empty() || !self.potential_popups.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorTiming {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scrape_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detect_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_timestamp: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookiePopupsResult {
    pub cmps: Vec<CmpInfo>,
    pub scraped_frames: Vec<ScrapedFrame>,
    #[serde(default)]
    pub timing: CollectorTiming,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Session-level failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlErrorCode {
    Navigation,
    Timeout,
    Autoconsent,
    Unknown,
}

impl CrawlErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Navigation => "navigation",
            Self::Timeout => "timeout",
            Self::Autoconsent => "autoconsent",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlError {
    pub code: CrawlErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlMeta {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// Outcome of the selector-based banner handlers that run when the consent
/// script found nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieBanner {
    pub detected: bool,
    pub provider: Option<String>,
    pub action: Option<ConsentMode>,
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub duration_ms: i64,
}

/// Everything one browser session produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlOutput {
    pub url: String,
    pub final_url: Option<String>,
    pub mode: ConsentMode,
    #[serde(default)]
    pub cookie_popups: Option<CookiePopupsResult>,
    #[serde(default)]
    pub cookie_banner: CookieBanner,
    #[serde(default)]
    pub requests: Vec<RequestRecord>,
    #[serde(default)]
    pub action_timestamp: Option<i64>,
    pub meta: CrawlMeta,
    #[serde(default)]
    pub error: Option<CrawlError>,
    /// Problems that did not end the session but make its results incomplete.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl CrawlOutput {
    /// An empty output for `mode`, used as the base that a session fills in.
    pub fn empty(url: &str, mode: ConsentMode) -> Self {
        let now = Utc::now();
        Self {
            url: url.to_string(),
            final_url: None,
            mode,
            cookie_popups: None,
            cookie_banner: CookieBanner::default(),
            requests: Vec::new(),
            action_timestamp: None,
            meta: CrawlMeta {
                started_at: now,
                finished_at: now,
                duration_ms: 0,
                user_agent: None,
            },
            error: None,
            warnings: Vec::new(),
        }
    }

    pub fn cmps(&self) -> &[CmpInfo] {
        self.cookie_popups
            .as_ref()
            .map(|p| p.cmps.as_slice())
            .unwrap_or_default()
    }
}
