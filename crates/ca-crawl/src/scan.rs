use chrono::Utc;
use rand::Rng;

use ca_core::catalog::ProviderCatalog;
use ca_core::config::AppConfig;
use ca_core::models::ConsentMode;
use ca_core::report::{build_report, AuditReport, ReportInput};
use ca_core::scoring::load_threat_weights;

use crate::session::CrawlRunner;

fn new_run_id() -> String {
    format!("run_{:016x}", rand::thread_rng().gen::<u64>())
}

/// Crawl `url` once per consent mode, concurrently, and build the report.
/// A failed session shows up as a report warning, never as an error.
pub async fn run_scan<R, C>(runner: &R, catalog: &C, url: &str, config: &AppConfig) -> AuditReport
where
    R: CrawlRunner + ?Sized,
    C: ProviderCatalog + ?Sized,
{
    let started_at = Utc::now();
    log::info!("scanning {url}");
    let (opt_out, opt_in) = tokio::join!(
        runner.crawl(url, ConsentMode::OptOut),
        runner.crawl(url, ConsentMode::OptIn)
    );
    let ended_at = Utc::now();

    let weights = load_threat_weights();
    build_report(
        ReportInput {
            run_id: new_run_id(),
            url,
            opt_out: &opt_out,
            opt_in: &opt_in,
            settings: &config.run,
            weights: &weights,
            started_at,
            ended_at,
        },
        catalog,
    )
}
