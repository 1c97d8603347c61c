//! Selector-based cookie banner handling.
//!
//! Runs when the consent script recognised nothing on the page. Each known
//! platform is checked by its banner root; when the root exists the reject or
//! accept button is clicked. A text match over visible buttons is the last
//! resort. The whole sequence is retried with a growing delay so late banners
//! still get a chance to render.

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::{sleep, Instant};

use ca_core::models::{ConsentMode, CookieBanner};

use crate::protocol::ProtocolSession;

/// Selectors for one consent platform's banner.
#[derive(Debug, Clone, Copy)]
pub struct BannerRule {
    pub provider: &'static str,
    pub root: &'static str,
    pub accept: &'static str,
    pub reject: &'static str,
}

pub const RULES: &[BannerRule] = &[
    BannerRule {
        provider: "OneTrust",
        root: "#onetrust-banner-sdk, .ot-sdk-container",
        accept: r#"#onetrust-accept-btn-handler, button[aria-label="Accept All"]"#,
        reject: r#"#onetrust-reject-all-handler, button[aria-label="Reject All"]"#,
    },
    BannerRule {
        provider: "Cookiebot",
        root: "#CybotCookiebotDialog, .CookiebotWidget",
        accept: r#"#CybotCookiebotDialogBodyLevelButtonAccept, button[data-cookieconsent="accept-all"]"#,
        reject: r#"#CybotCookiebotDialogBodyLevelButtonLevelOptinDeclineAll, button[data-cookieconsent="reject-all"]"#,
    },
    BannerRule {
        provider: "Didomi",
        root: ".didomi-consent-popup, #didomi-popup",
        accept: r#"button[aria-label="Agree to all"], .didomi-continue-without-agreeing"#,
        reject: r#"button[aria-label="Decline"], .didomi-notice-disagree"#,
    },
    BannerRule {
        provider: "Quantcast",
        root: ".qc-cmp2-container, .qc-cmp-ui, #qcCmpButtons",
        accept: r#".qc-cmp2-accept-all, .qc-cmp2-summary-buttons-accept, button[mode="primary"][data-accept]"#,
        reject: r#".qc-cmp2-reject-all, .qc-cmp2-summary-buttons-reject, button[mode="secondary"][data-reject]"#,
    },
    BannerRule {
        provider: "Sourcepoint",
        root: "#sp_message_container, .sp_veil",
        accept: r#".sp_choice_type_11, button[aria-label="Accept All"]"#,
        reject: r#".sp_choice_type_12, button[aria-label="Reject All"]"#,
    },
    BannerRule {
        provider: "TrustArc",
        root: "#truste-consent-track, .truste_box, .truste_box_overlay, .trustarc-ui",
        accept: r#"#truste-consent-button, [data-truste-action="accept"], button[aria-label="Accept All"]"#,
        reject: r#"#truste-reject-button, [data-truste-action="reject"], button[aria-label="Reject All"]"#,
    },
    BannerRule {
        provider: "Usercentrics",
        root: r#"#usercentrics-root, .uc-banner, .uc-overlay, [id^="usercentrics-"]"#,
        accept: r#"button[data-testid="uc-accept-all-button"], button[aria-label="Accept All"]"#,
        reject: r#"button[data-testid="uc-deny-all-button"], button[aria-label="Reject All"]"#,
    },
];

pub const GENERIC_PROVIDER: &str = "Generic";
const ACCEPT_WORDS: &str = r"accept|agree|allow|consent|\bok\b";
const REJECT_WORDS: &str = r"reject|decline|deny|refuse|necessary only";
const BUTTONS: &str = r#"button, [role="button"], input[type="button"], input[type="submit"]"#;

#[derive(Debug, Clone)]
pub struct BannerOptions {
    pub attempts: u32,
    /// Delay after attempt `n` is `n * base_delay`.
    pub base_delay: Duration,
}

impl Default for BannerOptions {
    fn default() -> Self {
        Self {
            attempts: 6,
            base_delay: Duration::from_millis(800),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BannerOutcome {
    pub banner: CookieBanner,
    /// Wall-clock epoch ms of the click, when one happened.
    pub acted_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(default)]
    clicked: bool,
    #[serde(default)]
    error: Option<String>,
}

fn js_string(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

fn rule_expression(rule: &BannerRule, mode: ConsentMode) -> String {
    let button = match mode {
        ConsentMode::OptIn => rule.accept,
        ConsentMode::OptOut => rule.reject,
    };
    format!(
        "(() => {{ \
           if (!document.querySelector({root})) return null; \
           const button = document.querySelector({button}); \
           if (!button) return {{ clicked: false }}; \
           try {{ button.click(); return {{ clicked: true }}; }} \
           catch (e) {{ return {{ clicked: false, error: String(e && e.message || e) }}; }} \
         }})()",
        root = js_string(rule.root),
        button = js_string(button),
    )
}

fn generic_expression(mode: ConsentMode) -> String {
    let words = match mode {
        ConsentMode::OptIn => ACCEPT_WORDS,
        ConsentMode::OptOut => REJECT_WORDS,
    };
    format!(
        "(() => {{ \
           const words = new RegExp({words}, 'i'); \
           for (const el of document.querySelectorAll({buttons})) {{ \
             const text = (el.textContent || el.value || '').trim(); \
             if (!text || !words.test(text)) continue; \
             try {{ el.click(); return {{ clicked: true }}; }} catch (e) {{}} \
           }} \
           return null; \
         }})()",
        words = js_string(words),
        buttons = js_string(BUTTONS),
    )
}

/// Provider name and check expression, in the order they are tried.
pub fn handlers(mode: ConsentMode) -> Vec<(&'static str, String)> {
    RULES
        .iter()
        .map(|rule| (rule.provider, rule_expression(rule, mode)))
        .chain(std::iter::once((GENERIC_PROVIDER, generic_expression(mode))))
        .collect()
}

/// Look for a known banner and answer it for `mode`. Never fails; evaluation
/// errors only mean that handler found nothing.
pub async fn auto_consent<S>(session: &S, mode: ConsentMode, options: &BannerOptions) -> BannerOutcome
where
    S: ProtocolSession + ?Sized,
{
    let started = Instant::now();
    let handlers = handlers(mode);

    for attempt in 1..=options.attempts {
        for (provider, expression) in &handlers {
            let hit = match session.evaluate_in_page(expression).await {
                Ok(Some(value)) if !value.is_null() => serde_json::from_value::<Hit>(value),
                Ok(_) => continue,
                Err(e) => {
                    log::debug!("[{mode}] {provider} banner check failed: {e}");
                    continue;
                }
            };
            let hit = match hit {
                Ok(hit) => hit,
                Err(e) => {
                    log::debug!("[{mode}] {provider} banner check returned junk: {e}");
                    continue;
                }
            };
            log::info!(
                "[{mode}] {provider} banner found on attempt {attempt}, clicked: {}",
                hit.clicked
            );
            return BannerOutcome {
                acted_at: hit.clicked.then(|| Utc::now().timestamp_millis()),
                banner: CookieBanner {
                    detected: true,
                    provider: Some(provider.to_string()),
                    action: hit.clicked.then_some(mode),
                    error: hit.error,
                    attempts: attempt,
                    duration_ms: started.elapsed().as_millis() as i64,
                },
            };
        }
        if attempt < options.attempts {
            sleep(options.base_delay * attempt).await;
        }
    }

    BannerOutcome {
        banner: CookieBanner {
            attempts: options.attempts,
            duration_ms: started.elapsed().as_millis() as i64,
            ..CookieBanner::default()
        },
        acted_at: None,
    }
}
