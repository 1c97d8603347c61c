//! One headless browser session per consent mode.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use chromiumoxide::cdp::browser_protocol::network::EnableParams;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use ca_core::config::AppConfig;
use ca_core::models::{ConsentMode, CookiePopupsResult, CrawlError, CrawlErrorCode, CrawlOutput};

use crate::autoconsent;
use crate::banner::{self, BannerOptions};
use crate::bridge::{Bridge, BridgeConfig};
use crate::collector::{CollectorOptions, CookiePopupsCollector};
use crate::protocol::ChromeSession;
use crate::recorder::RequestRecorder;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) consent-audit/0.1";

/// Runs a single consent session against a URL. Never fails: problems are
/// reported on the returned output.
#[async_trait]
pub trait CrawlRunner: Send + Sync {
    async fn crawl(&self, url: &str, mode: ConsentMode) -> CrawlOutput;
}

/// Per-session pieces that must be torn down even when the session fails.
#[derive(Default)]
struct Attached {
    recorder: Option<RequestRecorder>,
    collector: Option<CookiePopupsCollector<ChromeSession>>,
}

pub struct ChromeCrawler {
    config: AppConfig,
}

impl ChromeCrawler {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    fn user_agent(&self) -> &str {
        self.config
            .run
            .user_agent
            .as_deref()
            .unwrap_or(DEFAULT_USER_AGENT)
    }

    /// Each session gets its own profile so cookies and consent state never
    /// cross between the concurrent runs.
    fn browser_config(&self, profile: &Path) -> Result<BrowserConfig> {
        let viewport = self.config.run.viewport;
        let mut builder = BrowserConfig::builder()
            .user_data_dir(profile)
            .no_sandbox()
            .args(["--disable-gpu", "--disable-dev-shm-usage"])
            .window_size(viewport.width, viewport.height)
            .viewport(Viewport {
                width: viewport.width,
                height: viewport.height,
                ..Viewport::default()
            });
        if !self.config.browser.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &self.config.browser.executable {
            builder = builder.chrome_executable(path);
        }
        builder.build().map_err(anyhow::Error::msg)
    }

    async fn launch(&self, profile: &Path) -> Result<(Browser, JoinHandle<()>)> {
        let (browser, mut handler) = Browser::launch(self.browser_config(profile)?)
            .await
            .context("failed to launch browser")?;
        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    log::debug!("browser handler stopped: {e}");
                    break;
                }
            }
        });
        Ok((browser, events))
    }

    async fn drive(
        &self,
        browser: &Browser,
        url: &str,
        mode: ConsentMode,
        bundle: &str,
        attached: &mut Attached,
        output: &mut CrawlOutput,
    ) -> Result<(), CrawlError> {
        let unknown = |e: anyhow::Error| CrawlError::from_message(format!("{e:#}"));
        let timeouts = &self.config.timeouts;

        let page = browser
            .new_page("about:blank")
            .await
            .context("failed to open tab")
            .map_err(unknown)?;
        page.set_user_agent(self.user_agent())
            .await
            .context("failed to set user agent")
            .map_err(unknown)?;
        page.execute(EnableParams::default())
            .await
            .context("failed to enable network events")
            .map_err(unknown)?;
        let recorder = attached.recorder.insert(
            RequestRecorder::attach(&page, url)
                .await
                .map_err(unknown)?,
        );

        let mut bridge_config = BridgeConfig::new("");
        bridge_config.script = autoconsent::injected_source(&bridge_config.binding_name, bundle).into();
        let session = Arc::new(ChromeSession::new(page.clone()));
        let bridge = Bridge::new(Arc::clone(&session), bridge_config);
        let collector = attached.collector.insert(CookiePopupsCollector::new(
            bridge,
            CollectorOptions::from_timeouts(timeouts, Some(mode)),
        ));
        collector
            .start()
            .await
            .map_err(|e| CrawlError::new(CrawlErrorCode::Autoconsent, e.to_string()))?;

        log::info!("[{mode}] navigating to {url}");
        match timeout(Duration::from_millis(timeouts.navigation_ms), page.goto(url)).await {
            Err(_) => {
                return Err(CrawlError::new(
                    CrawlErrorCode::Timeout,
                    format!("navigation timeout of {} ms exceeded", timeouts.navigation_ms),
                ))
            }
            Ok(Err(e)) => return Err(CrawlError::from_message(format!("goto {url} failed: {e}"))),
            Ok(Ok(_)) => {}
        }
        output.final_url = page.url().await.ok().flatten();

        let frames = collector.attach_frames().await;
        log::debug!("[{mode}] isolated worlds created in {frames} frames");

        let budget = timeouts.total_budget_ms + timeouts.collector_extra_ms;
        collect_within(budget, collector.await_result(), output).await;
        output.action_timestamp = collector.action_timestamp();

        if output.cmps().iter().all(|c| c.name.is_empty()) {
            log::info!("[{mode}] no consent platform recognised, trying banner selectors");
            let banner_options = BannerOptions::default();
            let fallback = banner::auto_consent(session.as_ref(), mode, &banner_options);
            match timeout(Duration::from_millis(timeouts.action_ms), fallback).await {
                Ok(outcome) => {
                    if let Some(at) = outcome.acted_at {
                        output.action_timestamp.get_or_insert(at);
                    }
                    output.cookie_banner = outcome.banner;
                }
                Err(_) => output.warnings.push(format!(
                    "cookie banner fallback exceeded its {} ms budget",
                    timeouts.action_ms
                )),
            }
        }

        sleep(Duration::from_millis(timeouts.post_consent_wait_ms)).await;
        log::debug!("[{mode}] {} third-party requests so far", recorder.records().len());
        Ok(())
    }
}

#[async_trait]
impl CrawlRunner for ChromeCrawler {
    async fn crawl(&self, url: &str, mode: ConsentMode) -> CrawlOutput {
        let mut output = CrawlOutput::empty(url, mode);
        output.meta.user_agent = Some(self.user_agent().to_string());

        let finish = |mut output: CrawlOutput| {
            output.meta.finished_at = Utc::now();
            output.meta.duration_ms =
                (output.meta.finished_at - output.meta.started_at).num_milliseconds();
            if let Some(err) = &output.error {
                log::warn!("[{mode}] session failed: {err}");
            }
            output
        };

        let bundle = match autoconsent::load_bundle(&self.config.collector) {
            Ok(bundle) => bundle,
            Err(e) => {
                output.error = Some(CrawlError::new(CrawlErrorCode::Autoconsent, format!("{e:#}")));
                return finish(output);
            }
        };

        let profile = match tempfile::Builder::new().prefix("consent-audit-").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                output.error = Some(CrawlError::from_message(format!(
                    "failed to create browser profile: {e}"
                )));
                return finish(output);
            }
        };
        let (mut browser, events) = match self.launch(profile.path()).await {
            Ok(launched) => launched,
            Err(e) => {
                output.error = Some(CrawlError::from_message(format!("{e:#}")));
                return finish(output);
            }
        };

        let mut attached = Attached::default();
        if let Err(err) = self
            .drive(&browser, url, mode, &bundle, &mut attached, &mut output)
            .await
        {
            output.error = Some(err);
        }

        if let Some(collector) = &attached.collector {
            output.action_timestamp = output.action_timestamp.or(collector.action_timestamp());
            collector.shutdown();
        }
        if let Some(recorder) = &attached.recorder {
            output.requests = recorder.records();
            recorder.detach();
        }
        if let Err(e) = browser.close().await {
            log::debug!("[{mode}] browser close failed: {e}");
        }
        let _ = browser.wait().await;
        events.abort();
        if let Err(e) = profile.close() {
            log::debug!("[{mode}] profile cleanup failed: {e}");
        }

        log::info!("[{mode}] captured {} third-party requests", output.requests.len());
        finish(output)
    }
}

/// Run the collector under its outer budget. An expired budget leaves the
/// popup result empty and marks the session incomplete.
async fn collect_within<F>(budget_ms: u64, collect: F, output: &mut CrawlOutput)
where
    F: Future<Output = CookiePopupsResult>,
{
    let mode = output.mode;
    match timeout(Duration::from_millis(budget_ms), collect).await {
        Ok(result) => {
            log::info!(
                "[{mode}] {} CMPs, {} scraped frames, {} collector errors",
                result.cmps.len(),
                result.scraped_frames.len(),
                result.errors.len()
            );
            output.cookie_popups = Some(result);
        }
        Err(_) => {
            log::warn!("[{mode}] consent collector exceeded its {budget_ms} ms budget");
            output
                .warnings
                .push(format!("consent collector exceeded its {budget_ms} ms budget"));
        }
    }
}
