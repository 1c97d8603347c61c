use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;

use ca_core::catalog::ProviderRegistry;
use ca_core::checklist::Verdict;
use ca_core::config::{self, AppConfig};
use ca_crawl::scan::run_scan;
use ca_crawl::session::ChromeCrawler;

mod output;

#[derive(Parser)]
#[command(
    name = "consent-audit",
    about = "consent-audit: check whether a site honours cookie consent"
)]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.config/consent-audit/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl a site twice (opt-out and opt-in) and report tracking per consent stage
    Scan {
        /// Page to audit
        url: String,

        /// Output format
        #[arg(long, default_value = "rich")]
        format: String,

        /// Write the JSON report to file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Exit with status 2 when the verdict is fail
        #[arg(long)]
        strict: bool,
    },

    /// List the tracking providers the catalog can recognise
    Providers {
        /// Output format
        #[arg(long, default_value = "rich")]
        format: String,
    },

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => {
            let mut config = config::load_config_from(path);
            config.apply_env_overrides();
            config
        }
        None => config::load_config(),
    };

    match cli.command {
        Commands::Scan {
            url,
            format,
            output,
            strict,
        } => cmd_scan(&config, &url, &format, output, strict).await,
        Commands::Providers { format } => cmd_providers(&format),
        Commands::Config => cmd_config(&config, cli.config),
    }
}

async fn cmd_scan(
    config: &AppConfig,
    url: &str,
    format: &str,
    output_path: Option<PathBuf>,
    strict: bool,
) -> Result<()> {
    let catalog = ProviderRegistry::load()?;
    let crawler = ChromeCrawler::new(config.clone());

    if format == "rich" {
        println!();
        println!("  {}", "consent-audit".bold());
        println!("  {}", format!("Scanning {url}").dimmed());
    }

    let report = run_scan(&crawler, &catalog, url, config).await;
    log::info!(
        "{}: verdict {} with {} events",
        report.run.id,
        report.summary.verdict,
        report.events.len()
    );

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&report)?;
            if let Some(path) = &output_path {
                std::fs::write(path, &json)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                eprintln!("Report written to {}", path.display());
            } else {
                println!("{json}");
            }
        }
        _ => {
            output::print_report(&report);
            if let Some(path) = &output_path {
                let json = serde_json::to_string_pretty(&report)?;
                std::fs::write(path, json)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                eprintln!("Report written to {}", path.display());
            }
        }
    }

    if strict && report.summary.verdict == Verdict::Fail {
        std::process::exit(2);
    }
    Ok(())
}

fn cmd_providers(format: &str) -> Result<()> {
    let catalog = ProviderRegistry::load()?;
    if format == "json" {
        let rows: Vec<serde_json::Value> = catalog
            .providers()
            .iter()
            .map(|p| {
                serde_json::json!({
                    "key": p.key(),
                    "name": p.name(),
                    "type": p.display_type(),
                    "pattern": p.pattern(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        output::print_providers(&catalog);
    }
    Ok(())
}

fn cmd_config(config: &AppConfig, explicit: Option<PathBuf>) -> Result<()> {
    let path = explicit.unwrap_or_else(config::config_path);
    let state = if path.exists() { "found" } else { "not found, using defaults" };
    println!("# {} ({state})", path.display());
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
