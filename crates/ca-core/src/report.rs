//! Assemble the final audit report from two crawl sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::ProviderCatalog;
use crate::checklist::{build_checklist, Checklist, ChecklistInput, Verdict};
use crate::config::{RunSettings, Viewport};
use crate::models::{
    AuditEvent, CmpInfo, ConsentMode, CookieBanner, CrawlOutput, StagedRequest, TaggedDetection, ThreatLevel,
    Tracker,
};
use crate::normalize::EventNormalizer;
use crate::scoring::{compute_score, get_score_tier, ThreatWeights};
use crate::stage::partition;
use crate::thirdparty::registrable_domain;

pub const SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMeta {
    pub id: String,
    pub url: String,
    pub normalized_url: String,
    pub domain: String,
    pub locale: String,
    pub jurisdiction: String,
    pub user_agent: String,
    pub viewport: Viewport,
    pub gpc_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub events: usize,
    pub providers: usize,
    pub pre_consent: usize,
    pub after_opt_out: usize,
    pub after_opt_in: usize,
    pub leaks: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timings {
    pub started_at: i64,
    pub ended_at: i64,
    pub total: i64,
    pub cmp_detect: u64,
    pub opt_out_action: u64,
    pub opt_in_action: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub verdict: Verdict,
    pub reasons: Vec<String>,
    pub totals: Totals,
    pub timings_ms: Timings,
    pub score: u32,
    pub tier: String,
}

/// A consent platform as reported, merged across both sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCmp {
    pub name: String,
    pub rule_key: String,
    pub detected: bool,
    pub open: bool,
    #[serde(rename = "final")]
    pub is_final: bool,
    pub succeeded: bool,
    pub self_test_fail: bool,
    pub filter_list_matched: bool,
    pub detected_at_ms: u64,
    pub handled_at_ms: u64,
}

/// Fallback banner handling per session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieBanners {
    pub opt_out: CookieBanner,
    pub opt_in: CookieBanner,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub schema_version: String,
    pub run: RunMeta,
    pub summary: Summary,
    pub cmps: Vec<ReportCmp>,
    pub cookie_banner: CookieBanners,
    pub trackers: Vec<Tracker>,
    pub events: Vec<AuditEvent>,
    pub leaks: Vec<AuditEvent>,
    pub checklist: Checklist,
    pub warnings: Vec<String>,
}

/// Inputs to [`build_report`].
pub struct ReportInput<'a> {
    pub run_id: String,
    pub url: &'a str,
    pub opt_out: &'a CrawlOutput,
    pub opt_in: &'a CrawlOutput,
    pub settings: &'a RunSettings,
    pub weights: &'a ThreatWeights,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// `ruleKey` for a CMP name: lowercase, whitespace runs become `_`.
pub fn rule_key(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

/// Union of named CMPs from both sessions, opt-out first, first name wins.
/// A banner found only by the fallback handlers is listed under its provider.
pub fn merge_cmps(opt_out: &CrawlOutput, opt_in: &CrawlOutput) -> Vec<ReportCmp> {
    let mut out: Vec<ReportCmp> = Vec::new();
    for crawl in [opt_out, opt_in] {
        let timing = crawl
            .cookie_popups
            .as_ref()
            .map(|p| p.timing.clone())
            .unwrap_or_default();
        for cmp in crawl.cmps() {
            if cmp.name.is_empty() || out.iter().any(|c| c.name == cmp.name) {
                continue;
            }
            out.push(report_cmp(cmp, timing.detect_ms, timing.action_ms));
        }
        if let Some(cmp) = banner_cmp(&crawl.cookie_banner) {
            if !out.iter().any(|c| c.name == cmp.name) {
                out.push(cmp);
            }
        }
    }
    out
}

fn banner_cmp(banner: &CookieBanner) -> Option<ReportCmp> {
    if !banner.detected {
        return None;
    }
    let name = banner.provider.clone()?;
    Some(ReportCmp {
        rule_key: rule_key(&name),
        name,
        detected: true,
        open: true,
        is_final: false,
        succeeded: banner.action.is_some() && banner.error.is_none(),
        self_test_fail: false,
        filter_list_matched: false,
        detected_at_ms: 0,
        handled_at_ms: banner.duration_ms.max(0) as u64,
    })
}

fn report_cmp(cmp: &CmpInfo, detect_ms: Option<u64>, action_ms: Option<u64>) -> ReportCmp {
    ReportCmp {
        name: cmp.name.clone(),
        rule_key: rule_key(&cmp.name),
        detected: true,
        open: cmp.open,
        is_final: cmp.is_final,
        succeeded: cmp.succeeded,
        self_test_fail: cmp.self_test_fail,
        filter_list_matched: cmp.filter_list_matched,
        detected_at_ms: detect_ms.unwrap_or(0),
        handled_at_ms: action_ms.unwrap_or(0),
    }
}

/// Run every staged request through the catalog.
pub fn detect_staged<C>(catalog: &C, staged: Vec<StagedRequest>) -> Vec<TaggedDetection>
where
    C: ProviderCatalog + ?Sized,
{
    staged
        .into_iter()
        .flat_map(|s| {
            catalog
                .detect_all(&s.request.url, s.request.post_data.as_deref())
                .into_iter()
                .map(move |detection| TaggedDetection {
                    detection,
                    stage: s.stage,
                    request: s.request.clone(),
                })
        })
        .collect()
}

/// Report warnings for one session: its fatal error, then anything that left
/// it incomplete. Opt-out problems void the leak conclusions.
fn session_warnings(crawl: &CrawlOutput) -> Vec<String> {
    let mut out: Vec<String> = crawl
        .error
        .iter()
        .map(|err| format!("{} session failed {err}", crawl.mode))
        .collect();
    out.extend(
        crawl
            .warnings
            .iter()
            .map(|w| format!("{} session incomplete: {w}", crawl.mode)),
    );
    if crawl.mode == ConsentMode::OptOut {
        for msg in &mut out {
            msg.push_str(". Leak results are not meaningful for this run.");
        }
    }
    out
}

pub fn build_report<C>(input: ReportInput<'_>, catalog: &C) -> AuditReport
where
    C: ProviderCatalog + ?Sized,
{
    let ReportInput {
        run_id,
        url,
        opt_out,
        opt_in,
        settings,
        weights,
        started_at,
        ended_at,
    } = input;

    let mut normalizer = EventNormalizer::new();
    for crawl in [opt_out, opt_in] {
        let staged = partition(crawl);
        log::debug!("{} session: {} requests staged", crawl.mode, staged.len());
        for tagged in detect_staged(catalog, staged) {
            normalizer.push(tagged);
        }
    }
    let normalized = normalizer.finish();
    let events = normalized.events;
    let trackers = normalized.trackers;
    let leaks: Vec<AuditEvent> = events.iter().filter(|e| e.leak).cloned().collect();
    log::info!(
        "{} events from {} providers, {} leaks",
        events.len(),
        trackers.len(),
        leaks.len()
    );

    let cmps = merge_cmps(opt_out, opt_in);
    let warnings: Vec<String> = [opt_out, opt_in]
        .into_iter()
        .flat_map(session_warnings)
        .collect();

    let checklist = build_checklist(&ChecklistInput {
        url,
        locale: &settings.locale,
        events: &events,
        cmps: &cmps,
        session_errors: &warnings,
        opt_out_acted: opt_out.action_timestamp.is_some(),
    });

    let score = compute_score(&checklist.findings, weights);
    let mut reasons: Vec<String> = checklist
        .findings
        .iter()
        .filter(|f| f.threat_level != ThreatLevel::Info)
        .map(|f| f.title.clone())
        .collect();
    reasons.extend(warnings.iter().cloned());

    let count = |f: fn(&AuditEvent) -> bool| events.iter().filter(|e| f(e)).count();
    let totals = Totals {
        events: events.len(),
        providers: trackers.len(),
        pre_consent: count(|e| e.stages.pre_consent),
        after_opt_out: count(|e| e.stages.after_opt_out),
        after_opt_in: count(|e| e.stages.after_opt_in),
        leaks: leaks.len(),
    };

    let action_ms = |c: &CrawlOutput| {
        c.cookie_popups
            .as_ref()
            .and_then(|p| p.timing.action_ms)
            .unwrap_or(0)
    };
    let timings = Timings {
        started_at: started_at.timestamp_millis(),
        ended_at: ended_at.timestamp_millis(),
        total: (ended_at - started_at).num_milliseconds(),
        cmp_detect: opt_out
            .cookie_popups
            .as_ref()
            .and_then(|p| p.timing.detect_ms)
            .unwrap_or(0),
        opt_out_action: action_ms(opt_out),
        opt_in_action: action_ms(opt_in),
    };

    let normalized_url = opt_out
        .final_url
        .clone()
        .unwrap_or_else(|| url.to_string());
    let run = RunMeta {
        id: run_id,
        url: url.to_string(),
        domain: registrable_domain(&normalized_url).unwrap_or_default(),
        normalized_url,
        locale: settings.locale.clone(),
        jurisdiction: settings.jurisdiction.clone(),
        user_agent: opt_out
            .meta
            .user_agent
            .clone()
            .or_else(|| settings.user_agent.clone())
            .unwrap_or_default(),
        viewport: settings.viewport,
        gpc_enabled: settings.gpc_enabled,
    };

    AuditReport {
        schema_version: SCHEMA_VERSION.to_string(),
        run,
        summary: Summary {
            verdict: checklist.verdict,
            reasons,
            totals,
            timings_ms: timings,
            score,
            tier: get_score_tier(score).label.to_string(),
        },
        cmps,
        cookie_banner: CookieBanners {
            opt_out: opt_out.cookie_banner.clone(),
            opt_in: opt_in.cookie_banner.clone(),
        },
        trackers,
        events,
        leaks,
        checklist,
        warnings,
    }
}
