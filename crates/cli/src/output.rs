//! Terminal output helpers

use crate::history::RunSummary;
use agent_lib::models::TowerStats;
use colored::Colorize;
use std::path::Path;

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

pub fn format_cores(cores: f64) -> String {
    format!("{:.2} cores", cores)
}

pub fn format_latency(seconds: f64) -> String {
    format!("{:.0} ms", seconds * 1e3)
}

/// One line per orchestrator tick
pub fn print_tick(stats: &TowerStats) {
    let allocation = stats
        .allocation
        .map(format_cores)
        .unwrap_or_else(|| "-".to_string());
    let action = match (stats.action, stats.explore) {
        (Some(action), Some(explore)) if action != explore => {
            format!("{} (explore around {})", action, explore)
        }
        (Some(action), _) => action.to_string(),
        (None, _) => "-".to_string(),
    };
    println!(
        "  rps {:>8.1}  p99 {:>8}  allocation {:>12}  action {}",
        stats.rps,
        format_latency(stats.p99_latency),
        allocation,
        action.dimmed()
    );
}

pub fn print_summary(path: &Path, summary: &RunSummary, slo: f64) {
    println!("{}", path.display().to_string().bold());
    println!("  allocation   {}", format_cores(summary.allocation));
    println!("  average rps  {:.1}", summary.average_rps);
    if summary.slo_met {
        println!(
            "  p99 latency  {} {}",
            format_latency(summary.p99_latency),
            "(SLO met)".green()
        );
    } else {
        println!(
            "  p99 latency  {} {}",
            format_latency(summary.p99_latency),
            format!("(SLO {} missed)", format_latency(slo)).red()
        );
    }
}
