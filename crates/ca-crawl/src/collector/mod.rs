//! Consent popup collector.
//!
//! Drives the injected consent script through one tab: answers its
//! handshake, performs the requested consent action once the pre-consent
//! DOM has been scraped, and aggregates what the script reported into
//! per-CMP records.

pub mod messages;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::{sleep, timeout, Instant};

use ca_core::config::Timeouts;
use ca_core::models::{CmpInfo, CollectorTiming, ConsentMode, CookiePopupsResult, ScrapedFrame};

use crate::bridge::{Bridge, MessageHandler};
use crate::protocol::{Diagnostic, ProtocolSession};
use messages::{InitConfig, Inbound, Outbound};

const SCRAPE_SCRIPT: &str = include_str!("scrape.js");

const DETECT_POLL: Duration = Duration::from_millis(200);
const ACTION_POLL: Duration = Duration::from_millis(1000);
const FINISH_POLL: Duration = Duration::from_millis(100);
const FINISH_WAIT: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq)]
pub struct CollectorOptions {
    /// Consent action to perform once a popup is found. `None` only observes.
    pub action: Option<ConsentMode>,
    pub detect_timeout: Duration,
    pub found_timeout: Duration,
    pub action_timeout: Duration,
    pub scrape_timeout: Duration,
}

impl CollectorOptions {
    pub fn from_timeouts(timeouts: &Timeouts, action: Option<ConsentMode>) -> Self {
        Self {
            action,
            detect_timeout: Duration::from_millis(timeouts.detect_ms),
            found_timeout: Duration::from_millis(timeouts.found_ms),
            action_timeout: Duration::from_millis(timeouts.action_ms),
            scrape_timeout: Duration::from_millis(timeouts.scrape_ms),
        }
    }
}

/// A message from the script and the isolated context that sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub context: String,
    pub message: Inbound,
}

#[derive(Debug, Default)]
struct State {
    log: Vec<ReceivedMessage>,
    self_test_context: Option<String>,
    action_timestamp: Option<i64>,
    errors: Vec<String>,
}

struct Shared<S> {
    bridge: Bridge<S>,
    options: CollectorOptions,
    state: Mutex<State>,
    scrape_done: watch::Sender<bool>,
    tasks: Mutex<Vec<AbortHandle>>,
    started: Instant,
}

impl<S> Shared<S> {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn track(&self, handle: AbortHandle) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }
}

pub struct CookiePopupsCollector<S> {
    shared: Arc<Shared<S>>,
}

struct Dispatcher<S> {
    shared: Arc<Shared<S>>,
}

#[async_trait]
impl<S: ProtocolSession> MessageHandler for Dispatcher<S> {
    async fn handle(&self, message: Value, context_id: String) {
        on_message(&self.shared, message, context_id).await;
    }
}

async fn on_message<S: ProtocolSession>(shared: &Arc<Shared<S>>, raw: Value, context: String) {
    let message = Inbound::parse(&raw);
    log::debug!("consent script -> {} ({context})", message.type_name());
    shared.state().log.push(ReceivedMessage {
        context: context.clone(),
        message: message.clone(),
    });

    match message {
        Inbound::Init => {
            let reply = Outbound::InitResp {
                config: InitConfig::default(),
            };
            shared
                .bridge
                .evaluate_in_context(&context, &reply.to_expression())
                .await;
        }
        Inbound::PopupFound { cmp } => {
            let Some(mode) = shared.options.action else {
                return;
            };
            log::info!("popup found for {cmp}, sending {mode} after scrape");
            let task = Arc::clone(shared);
            let handle = tokio::spawn(async move {
                let mut scraped = task.scrape_done.subscribe();
                let ready = scraped.wait_for(|done| *done).await.is_ok();
                if !ready {
                    return;
                }
                {
                    let mut state = task.state();
                    if state.action_timestamp.is_none() {
                        state.action_timestamp = Some(Utc::now().timestamp_millis());
                    }
                }
                task.bridge
                    .evaluate_in_context(&context, &Outbound::action(mode).to_expression())
                    .await;
            });
            shared.track(handle.abort_handle());
        }
        Inbound::OptInResult {
            schedule_self_test, ..
        }
        | Inbound::OptOutResult {
            schedule_self_test, ..
        } => {
            if schedule_self_test {
                shared.state().self_test_context = Some(context);
            }
        }
        Inbound::AutoconsentDone { .. } => {
            let target = shared.state().self_test_context.clone();
            if let Some(target) = target {
                shared
                    .bridge
                    .evaluate_in_context(&target, &Outbound::SelfTest.to_expression())
                    .await;
            }
        }
        Inbound::Eval { id, code } => {
            let result = shared.bridge.evaluate_in_default_world(&context, &code).await;
            let reply = Outbound::EvalResp { id, result };
            shared
                .bridge
                .evaluate_in_context(&context, &reply.to_expression())
                .await;
        }
        Inbound::AutoconsentError { details } => {
            log::warn!("autoconsent error: {details}");
            shared
                .state()
                .errors
                .push(format!("autoconsent error: {details}"));
        }
        Inbound::CmpDetected { .. }
        | Inbound::SelfTestResult { .. }
        | Inbound::Report { .. }
        | Inbound::Unknown => {}
    }
}

async fn scrape_frames<S: ProtocolSession>(shared: Arc<Shared<S>>) -> (Vec<ScrapedFrame>, u64) {
    let began = Instant::now();
    let contexts = shared.bridge.isolated_contexts();
    let jobs = contexts.iter().map(|context| {
        let shared = &shared;
        async move {
            let call = shared.bridge.evaluate_for_value(context, SCRAPE_SCRIPT);
            match timeout(shared.options.scrape_timeout, call).await {
                Ok(Ok(value)) => serde_json::from_value::<ScrapedFrame>(value)
                    .ok()
                    .filter(ScrapedFrame::has_content),
                Ok(Err(e)) => {
                    shared.state().errors.push(format!("scrape error: {e}"));
                    None
                }
                Err(_) => {
                    log::debug!("scrape timed out in {context}");
                    None
                }
            }
        }
    });
    let frames: Vec<ScrapedFrame> = join_all(jobs).await.into_iter().flatten().collect();
    shared.scrape_done.send_replace(true);
    (frames, millis(began.elapsed()))
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl<S: ProtocolSession> CookiePopupsCollector<S> {
    pub fn new(bridge: Bridge<S>, options: CollectorOptions) -> Self {
        let (scrape_done, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                bridge,
                options,
                state: Mutex::new(State::default()),
                scrape_done,
                tasks: Mutex::new(Vec::new()),
                started: Instant::now(),
            }),
        }
    }

    /// Subscribe to the bridge and register the binding. Must run before
    /// navigation so no context announcement is missed.
    pub async fn start(&self) -> Result<(), Diagnostic> {
        let dispatcher = Arc::new(Dispatcher {
            shared: Arc::clone(&self.shared),
        });
        let pump = self.shared.bridge.subscribe(dispatcher).await?;
        self.shared.track(pump.abort_handle());
        self.shared.bridge.add_binding().await;
        Ok(())
    }

    /// Create the isolated worlds for every frame currently in the tab.
    pub async fn attach_frames(&self) -> usize {
        self.shared.bridge.create_contexts_for_all_frames().await
    }

    /// Wall-clock epoch ms at which the consent action was sent.
    pub fn action_timestamp(&self) -> Option<i64> {
        self.shared.state().action_timestamp
    }

    pub fn messages(&self) -> Vec<ReceivedMessage> {
        self.shared.state().log.clone()
    }

    async fn wait_for<F>(&self, limit: Duration, poll: Duration, pred: F) -> Option<ReceivedMessage>
    where
        F: Fn(&ReceivedMessage) -> bool,
    {
        let deadline = Instant::now() + limit;
        loop {
            let hit = self.shared.state().log.iter().find(|m| pred(m)).cloned();
            if hit.is_some() {
                return hit;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            sleep(poll.min(deadline - now)).await;
        }
    }

    /// Wait for the script to detect, show and handle a popup, then
    /// aggregate. Missed deadlines leave data absent; this never fails.
    pub async fn await_result(&self) -> CookiePopupsResult {
        let options = &self.shared.options;
        let scrape = tokio::spawn(scrape_frames(Arc::clone(&self.shared)));
        self.shared.track(scrape.abort_handle());

        let began = Instant::now();
        let detected = self
            .wait_for(options.detect_timeout, DETECT_POLL, |m| {
                matches!(m.message, Inbound::CmpDetected { .. })
            })
            .await;
        let detect_ms = millis(began.elapsed());

        let found = match detected {
            Some(_) => {
                self.wait_for(options.found_timeout, DETECT_POLL, |m| {
                    matches!(m.message, Inbound::PopupFound { .. })
                })
                .await
            }
            None => None,
        };

        let (scraped_frames, scrape_ms) = match scrape.await {
            Ok((frames, ms)) => (frames, Some(ms)),
            Err(e) => {
                log::debug!("scrape task ended early: {e}");
                (Vec::new(), None)
            }
        };

        let mut action_ms = None;
        if let (Some(mode), Some(found)) = (options.action, found) {
            let cmp = match &found.message {
                Inbound::PopupFound { cmp } => cmp.clone(),
                _ => String::new(),
            };
            let action_began = Instant::now();
            self.wait_for(options.action_timeout, ACTION_POLL, |m| {
                m.message
                    .action_result(mode)
                    .is_some_and(|(name, _, _)| name == cmp)
            })
            .await;
            action_ms = Some(millis(action_began.elapsed()));

            self.wait_for(FINISH_WAIT, FINISH_POLL, |m| {
                matches!(m.message, Inbound::AutoconsentDone { .. })
            })
            .await;
            let self_test_scheduled = self.shared.state().self_test_context.is_some();
            if self_test_scheduled {
                self.wait_for(FINISH_WAIT, FINISH_POLL, |m| {
                    matches!(m.message, Inbound::SelfTestResult { .. })
                })
                .await;
            }
        }

        let (cmps, mut errors, action_timestamp) = {
            let state = self.shared.state();
            (
                aggregate_cmps(&state.log, options.action),
                state.errors.clone(),
                state.action_timestamp,
            )
        };
        errors.extend(self.shared.bridge.errors());

        CookiePopupsResult {
            cmps,
            scraped_frames,
            timing: CollectorTiming {
                scrape_ms,
                detect_ms: Some(detect_ms),
                action_ms,
                total_ms: Some(millis(self.shared.started.elapsed())),
                action_timestamp,
            },
            errors,
        }
    }

    /// Abort the event pump and any in-flight scrape or action.
    pub fn shutdown(&self) {
        let handles = std::mem::take(&mut *self.shared.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            handle.abort();
        }
    }
}

fn dedup_into(out: &mut Vec<String>, items: &[String]) {
    for item in items {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
}

/// Fold the message log into one record per named CMP, in order of first
/// detection. A nameless heuristic record is produced only when no CMP was
/// named at all.
pub fn aggregate_cmps(log: &[ReceivedMessage], action: Option<ConsentMode>) -> Vec<CmpInfo> {
    let mut patterns = Vec::new();
    let mut snippets = Vec::new();
    let mut errors = Vec::new();
    let mut done_cmp = None;
    let mut self_test = None;
    let mut filter_list_matched = false;

    for entry in log {
        match &entry.message {
            Inbound::Report { state } => {
                dedup_into(&mut patterns, &state.heuristic_patterns);
                dedup_into(&mut snippets, &state.heuristic_snippets);
            }
            Inbound::AutoconsentError { details } => errors.push(details.to_string()),
            Inbound::AutoconsentDone { cmp } if done_cmp.is_none() => done_cmp = Some(cmp.as_str()),
            Inbound::SelfTestResult { result } if self_test.is_none() => self_test = Some(*result),
            Inbound::PopupFound { cmp } if cmp == "filterList" => filter_list_matched = true,
            _ => {}
        }
    }

    let self_test_fail = self_test == Some(false);

    let mut names: Vec<&str> = Vec::new();
    for entry in log {
        if let Inbound::CmpDetected { cmp } = &entry.message {
            if !cmp.is_empty() && !names.contains(&cmp.as_str()) {
                names.push(cmp.as_str());
            }
        }
    }

    let mut cmps: Vec<CmpInfo> = names
        .into_iter()
        .map(|name| {
            let open = log
                .iter()
                .any(|m| matches!(&m.message, Inbound::PopupFound { cmp } if cmp == name));
            let succeeded = action.is_some_and(|mode| {
                log.iter().any(|m| {
                    m.message
                        .action_result(mode)
                        .is_some_and(|(cmp, ok, _)| cmp == name && ok)
                })
            });
            CmpInfo {
                name: name.to_string(),
                is_final: done_cmp == Some(name),
                open,
                started: action.is_some() && open,
                succeeded,
                self_test_fail,
                errors: errors.clone(),
                patterns: patterns.clone(),
                snippets: snippets.clone(),
                filter_list_matched,
            }
        })
        .collect();

    if cmps.is_empty() && !patterns.is_empty() {
        cmps.push(CmpInfo {
            patterns,
            snippets,
            filter_list_matched,
            ..CmpInfo::default()
        });
    }
    cmps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeConfig;
    use crate::testing::FakeSession;
    use serde_json::json;

    const BINDING: &str = "sendOut";

    fn bridge(session: &Arc<FakeSession>) -> Bridge<FakeSession> {
        Bridge::new(
            Arc::clone(session),
            BridgeConfig {
                world_name: "audit-world".to_string(),
                binding_name: BINDING.to_string(),
                script: Arc::from("/* consent script */"),
            },
        )
    }

    fn options(action: Option<ConsentMode>) -> CollectorOptions {
        CollectorOptions::from_timeouts(&Timeouts::default(), action)
    }

    fn entry(message: Value) -> ReceivedMessage {
        ReceivedMessage {
            context: "iso-top".to_string(),
            message: Inbound::parse(&message),
        }
    }

    fn scraped_top() -> Value {
        json!({
            "isTop": true,
            "origin": "https://shop.example",
            "cleanedText": "We use cookies",
            "buttons": [{"text": "Reject all", "selector": "button#reject"}],
            "potentialPopups": []
        })
    }

    /// Session whose script detects "Acme", then answers the opt-out and
    /// the self-test.
    fn scripted_session() -> Arc<FakeSession> {
        Arc::new(FakeSession::new(&["top"]).responder(|fake, ctx, expr| {
            if expr == "/* consent script */" {
                fake.send(BINDING, ctx, json!({"type": "init"}));
                fake.send(BINDING, ctx, json!({"type": "cmpDetected", "cmp": "Acme"}));
                fake.send(BINDING, ctx, json!({"type": "popupFound", "cmp": "Acme"}));
            } else if expr.contains("\"type\":\"optOut\"") {
                fake.send(
                    BINDING,
                    ctx,
                    json!({"type": "optOutResult", "cmp": "Acme", "result": true, "scheduleSelfTest": true}),
                );
                fake.send(BINDING, ctx, json!({"type": "autoconsentDone", "cmp": "Acme"}));
            } else if expr.contains("\"type\":\"selfTest\"") {
                fake.send(BINDING, ctx, json!({"type": "selfTestResult", "result": false}));
            } else if expr.contains("potentialPopups") {
                return Ok(Some(scraped_top()));
            }
            Ok(None)
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn opt_out_flow_runs_action_after_scrape_and_self_test() {
        let session = scripted_session();
        session.open_default_context("top");
        let collector = CookiePopupsCollector::new(bridge(&session), options(Some(ConsentMode::OptOut)));
        collector.start().await.unwrap();
        assert_eq!(collector.attach_frames().await, 1);

        let result = collector.await_result().await;
        collector.shutdown();

        assert_eq!(result.cmps.len(), 1);
        let acme = &result.cmps[0];
        assert_eq!(acme.name, "Acme");
        assert!(acme.is_final && acme.open && acme.started && acme.succeeded);
        assert!(acme.self_test_fail);
        assert_eq!(result.scraped_frames.len(), 1);
        assert_eq!(result.scraped_frames[0].cleaned_text, "We use cookies");
        assert!(collector.action_timestamp().is_some());
        assert_eq!(result.timing.action_timestamp, collector.action_timestamp());

        let evaluated: Vec<String> = session.evaluated().into_iter().map(|(_, e)| e).collect();
        let scrape_at = evaluated.iter().position(|e| e.contains("potentialPopups")).unwrap();
        let action_at = evaluated
            .iter()
            .position(|e| e.contains("\"type\":\"optOut\""))
            .unwrap();
        assert!(scrape_at < action_at);
        assert!(evaluated.iter().any(|e| e.contains("\"type\":\"initResp\"")));
        assert!(evaluated.iter().any(|e| e.contains("\"type\":\"selfTest\"")));
    }

    #[tokio::test(start_paused = true)]
    async fn observing_session_never_acts() {
        let session = scripted_session();
        let collector = CookiePopupsCollector::new(bridge(&session), options(None));
        collector.start().await.unwrap();
        collector.attach_frames().await;

        let result = collector.await_result().await;
        collector.shutdown();

        assert_eq!(result.cmps.len(), 1);
        assert!(result.cmps[0].open);
        assert!(!result.cmps[0].started);
        assert!(collector.action_timestamp().is_none());
        assert!(!session
            .evaluated()
            .iter()
            .any(|(_, e)| e.contains("\"type\":\"optOut\"")));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_page_resolves_within_the_outer_budget() {
        let timeouts = Timeouts::default();
        let session = Arc::new(FakeSession::new(&["top", "ad-frame"]));
        let collector = CookiePopupsCollector::new(bridge(&session), options(Some(ConsentMode::OptIn)));
        collector.start().await.unwrap();
        collector.attach_frames().await;

        let budget = Duration::from_millis(timeouts.total_budget_ms + timeouts.collector_extra_ms);
        let began = Instant::now();
        let result = timeout(budget, collector.await_result()).await;
        assert!(began.elapsed() <= budget);
        let result = result.expect("collector finished inside the budget");
        collector.shutdown();

        assert!(result.cmps.is_empty());
        assert!(result.scraped_frames.is_empty());
        assert!(collector.action_timestamp().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn outer_race_cuts_a_slow_collector() {
        let session = Arc::new(FakeSession::new(&["top"]));
        let mut opts = options(Some(ConsentMode::OptOut));
        opts.detect_timeout = Duration::from_secs(600);
        let collector = CookiePopupsCollector::new(bridge(&session), opts);
        collector.start().await.unwrap();

        let budget = Duration::from_millis(40_000);
        let began = Instant::now();
        let result = timeout(budget, collector.await_result()).await;
        assert!(result.is_err());
        assert!(began.elapsed() <= budget + Duration::from_millis(1));
        collector.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn eval_replies_with_truthiness_only() {
        let session = Arc::new(FakeSession::new(&["top"]).responder(|fake, ctx, expr| {
            if expr == "/* consent script */" {
                fake.send(
                    BINDING,
                    ctx,
                    json!({"type": "eval", "id": 3, "code": "document.cookie"}),
                );
            } else if ctx == "main-top" {
                return Ok(Some(json!("session=abc")));
            }
            Ok(None)
        }));
        session.open_default_context("top");
        let collector = CookiePopupsCollector::new(bridge(&session), options(None));
        collector.start().await.unwrap();
        collector.attach_frames().await;
        sleep(Duration::from_millis(50)).await;
        collector.shutdown();

        let evaluated = session.evaluated();
        assert!(evaluated.contains(&("main-top".to_string(), "document.cookie".to_string())));
        assert!(evaluated.contains(&(
            "iso-top".to_string(),
            "autoconsentReceiveMessage({\"type\":\"evalResp\",\"id\":3,\"result\":true})".to_string()
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn script_errors_are_recorded_not_fatal() {
        let session = Arc::new(FakeSession::new(&["top"]).responder(|fake, ctx, expr| {
            if expr == "/* consent script */" {
                fake.send(
                    BINDING,
                    ctx,
                    json!({"type": "autoconsentError", "details": {"msg": "rule crashed"}}),
                );
                fake.send(BINDING, ctx, json!({"type": "cmpDetected", "cmp": "Acme"}));
            }
            Ok(None)
        }));
        let collector = CookiePopupsCollector::new(bridge(&session), options(None));
        collector.start().await.unwrap();
        collector.attach_frames().await;

        let result = collector.await_result().await;
        collector.shutdown();

        assert_eq!(result.cmps.len(), 1);
        assert_eq!(result.cmps[0].errors, vec!["{\"msg\":\"rule crashed\"}"]);
        assert!(result.errors[0].contains("rule crashed"));
    }

    #[test]
    fn anonymous_record_only_without_named_cmps() {
        let heuristics = entry(json!({
            "type": "report",
            "state": {"heuristicPatterns": ["reject all", "reject all"], "heuristicSnippets": ["<div>"]}
        }));

        let only_heuristics = aggregate_cmps(&[heuristics.clone()], None);
        assert_eq!(only_heuristics.len(), 1);
        assert_eq!(only_heuristics[0].name, "");
        assert_eq!(only_heuristics[0].patterns, vec!["reject all"]);
        assert!(!only_heuristics[0].open);

        let named = aggregate_cmps(
            &[heuristics, entry(json!({"type": "cmpDetected", "cmp": "Acme"}))],
            None,
        );
        assert_eq!(named.len(), 1);
        assert_eq!(named[0].name, "Acme");
        assert_eq!(named[0].patterns, vec!["reject all"]);
    }

    #[test]
    fn cmps_keep_detection_order_and_match_results_by_name() {
        let log = vec![
            entry(json!({"type": "cmpDetected", "cmp": "Beta"})),
            entry(json!({"type": "cmpDetected", "cmp": "Acme"})),
            entry(json!({"type": "cmpDetected", "cmp": "Beta"})),
            entry(json!({"type": "popupFound", "cmp": "Acme"})),
            entry(json!({"type": "popupFound", "cmp": "filterList"})),
            entry(json!({"type": "optInResult", "cmp": "Acme", "result": true})),
            entry(json!({"type": "autoconsentDone", "cmp": "Acme"})),
        ];
        let cmps = aggregate_cmps(&log, Some(ConsentMode::OptIn));
        let names: Vec<&str> = cmps.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Beta", "Acme"]);
        assert!(!cmps[0].open && !cmps[0].succeeded && !cmps[0].is_final);
        assert!(cmps[1].open && cmps[1].started && cmps[1].succeeded && cmps[1].is_final);
        assert!(cmps.iter().all(|c| c.filter_list_matched));

        let wrong_mode = aggregate_cmps(&log, Some(ConsentMode::OptOut));
        assert!(!wrong_mode[1].succeeded);
    }

    #[test]
    fn only_the_first_self_test_result_counts() {
        let log = |first: bool, second: bool| {
            vec![
                entry(json!({"type": "cmpDetected", "cmp": "Acme"})),
                entry(json!({"type": "selfTestResult", "result": first})),
                entry(json!({"type": "selfTestResult", "result": second})),
            ]
        };
        assert!(!aggregate_cmps(&log(true, false), None)[0].self_test_fail);
        assert!(aggregate_cmps(&log(false, true), None)[0].self_test_fail);
    }

    #[test]
    fn nothing_reported_means_no_records() {
        assert!(aggregate_cmps(&[entry(json!({"type": "init"}))], Some(ConsentMode::OptOut)).is_empty());
    }
}
