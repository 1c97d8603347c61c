use comfy_table::{Cell, Color, Table};
use owo_colors::OwoColorize;

use ca_core::catalog::ProviderRegistry;
use ca_core::checklist::{StageResult, Verdict};
use ca_core::models::ThreatLevel;
use ca_core::report::AuditReport;
use ca_core::scoring::get_score_tier;

fn tier_color(color: &str) -> Color {
    match color {
        "green" => Color::Green,
        "blue" => Color::Blue,
        "yellow" => Color::Yellow,
        "red" => Color::Red,
        "dark_orange" => Color::DarkYellow,
        _ => Color::White,
    }
}

fn verdict_badge(verdict: Verdict) -> String {
    match verdict {
        Verdict::Pass => " PASS ".on_green().black().bold().to_string(),
        Verdict::Warn => " WARN ".on_yellow().black().bold().to_string(),
        Verdict::Fail => " FAIL ".on_red().white().bold().to_string(),
    }
}

fn pass_cell(pass: bool) -> Cell {
    if pass {
        Cell::new("ok").fg(Color::Green)
    } else {
        Cell::new("fail").fg(Color::Red)
    }
}

fn vendor_list(stage: &StageResult) -> String {
    stage
        .vendors
        .iter()
        .map(|v| format!("{} ({})", v.name, v.count))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Print the full report for the terminal.
pub fn print_report(report: &AuditReport) {
    let summary = &report.summary;
    let tier = get_score_tier(summary.score);
    let score = summary.score.to_string();
    let score_colored = match tier.color {
        "green" => score.green().to_string(),
        "blue" => score.blue().to_string(),
        "yellow" => score.yellow().to_string(),
        "red" | "dark_orange" => score.red().to_string(),
        _ => score,
    };

    println!();
    println!(
        "  {} {} {}/100 {}",
        verdict_badge(summary.verdict),
        report.run.normalized_url.bold(),
        score_colored,
        format_args!(
            "({}) · {} events · {} providers · {} leaks",
            summary.tier, summary.totals.events, summary.totals.providers, summary.totals.leaks
        )
        .dimmed(),
    );
    println!(
        "  {}",
        format_args!(
            "{} · {} · run {} · {} ms",
            report.run.locale, report.run.jurisdiction, report.run.id, summary.timings_ms.total
        )
        .dimmed()
    );
    println!();

    let stages = &report.checklist.stages;
    let mut table = Table::new();
    table.set_header(vec!["Stage", "Result", "3rd-party events", "Vendors"]);
    for (label, stage) in [
        ("Before consent", &stages.pre_consent),
        ("After opt-out", &stages.after_opt_out),
        ("After opt-in", &stages.after_opt_in),
    ] {
        table.add_row(vec![
            Cell::new(label),
            pass_cell(stage.pass),
            Cell::new(stage.third_party_requests),
            Cell::new(vendor_list(stage)),
        ]);
    }
    let popup = &stages.popup;
    table.add_row(vec![
        Cell::new("Consent popup"),
        pass_cell(popup.pass),
        Cell::new(""),
        Cell::new(if popup.cmp.is_empty() { "none detected" } else { popup.cmp.as_str() }),
    ]);
    println!("{table}");

    if !report.cmps.is_empty() {
        println!();
        let mut cmps = Table::new();
        cmps.set_header(vec!["CMP", "Open", "Handled", "Succeeded", "Self-test"]);
        for cmp in &report.cmps {
            let name = if cmp.name.is_empty() { "(heuristic)" } else { cmp.name.as_str() };
            cmps.add_row(vec![
                Cell::new(name),
                Cell::new(cmp.open),
                Cell::new(cmp.is_final),
                pass_cell(cmp.succeeded),
                pass_cell(!cmp.self_test_fail),
            ]);
        }
        println!("{cmps}");
    }
    for (label, banner) in [
        ("opt-out", &report.cookie_banner.opt_out),
        ("opt-in", &report.cookie_banner.opt_in),
    ] {
        if banner.detected {
            let action = if banner.action.is_some() { "answered" } else { "not answered" };
            println!(
                "  {}",
                format_args!(
                    "{label}: {} banner {action} by selector fallback after {} attempt(s)",
                    banner.provider.as_deref().unwrap_or("unknown"),
                    banner.attempts
                )
                .dimmed()
            );
        }
    }

    let trackers = &stages.trackers.summary;
    if !trackers.is_empty() {
        println!();
        let mut table = Table::new();
        table.set_header(vec!["Provider", "Type", "Pre", "Opt-out", "Opt-in"]);
        for t in trackers {
            let leak_color = if t.after_opt_out > 0 {
                Color::Red
            } else {
                Color::White
            };
            table.add_row(vec![
                Cell::new(&t.name),
                Cell::new(&t.tracker_type),
                Cell::new(t.pre_consent),
                Cell::new(t.after_opt_out).fg(leak_color),
                Cell::new(t.after_opt_in),
            ]);
        }
        println!("{table}");
    }

    if !report.checklist.findings.is_empty() {
        println!();
    }
    for finding in &report.checklist.findings {
        let level_str = match finding.threat_level {
            ThreatLevel::Critical => " CRIT ".on_red().white().bold().to_string(),
            ThreatLevel::High => " HIGH ".on_red().white().to_string(),
            ThreatLevel::Medium => " WARN ".on_yellow().black().to_string(),
            ThreatLevel::Low => " LOW  ".on_blue().white().to_string(),
            ThreatLevel::Info => " INFO ".on_white().black().to_string(),
        };
        println!("    {level_str} {}", finding.title);
        if finding.threat_level != ThreatLevel::Info {
            println!("           {}", finding.description.dimmed());
            println!("           {} {}", "Fix:".blue(), finding.remediation);
        }
    }

    for warning in &report.warnings {
        println!("  {} {warning}", "!".yellow().bold());
    }
    for note in &report.checklist.notes {
        println!("  {}", note.dimmed());
    }
    println!();
}

/// Print the provider catalog.
pub fn print_providers(catalog: &ProviderRegistry) {
    println!();
    println!("  {}", "consent-audit".bold());
    println!("  {}", "Provider Catalog".dimmed());
    println!();

    let mut table = Table::new();
    table.set_header(vec!["Key", "Name", "Type", "Pattern"]);
    for provider in catalog.providers() {
        table.add_row(vec![
            Cell::new(provider.key()),
            Cell::new(provider.name()),
            Cell::new(provider.display_type()).fg(tier_color(type_color(provider.display_type()))),
            Cell::new(provider.pattern()).fg(Color::DarkGrey),
        ]);
    }
    println!("{table}");
    println!();
    println!("  {} providers", catalog.len().to_string().bold());
    println!();
}

fn type_color(display_type: &str) -> &'static str {
    match display_type {
        "Marketing" => "red",
        "Analytics" => "dark_orange",
        "Tag Manager" => "blue",
        "Session Replay/Heat Maps" | "Visitor Identification" => "yellow",
        _ => "green",
    }
}
