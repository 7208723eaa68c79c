//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use ramp_lib::{Phase, Scenario, TerminationReason};
use serde::Serialize;

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format an optional QPS level
pub fn format_qps(qps: Option<u64>) -> String {
    qps.map_or_else(|| "-".to_string(), |q| q.to_string())
}

/// Format a percentage
pub fn format_percent(value: f64) -> String {
    format!("{:.1}%", value)
}

/// Format a millisecond latency
pub fn format_ms(value: f64) -> String {
    if value >= 1000.0 {
        format!("{:.2}s", value / 1000.0)
    } else {
        format!("{:.1}ms", value)
    }
}

/// Color a verdict scenario
pub fn color_scenario(scenario: Scenario) -> String {
    let s = scenario.as_str();
    match scenario {
        Scenario::Normal => s.green().to_string(),
        Scenario::ResourceFalsePositive => s.cyan().to_string(),
        Scenario::RpcViolation => s.yellow().to_string(),
        Scenario::ResourcePlusUnhealthy => s.red().to_string(),
        Scenario::NodeFailure => s.red().bold().to_string(),
    }
}

/// Color a run phase
pub fn color_phase(phase: Phase) -> String {
    let s = phase.to_string();
    match phase {
        Phase::Warmup | Phase::Cooldown => s.yellow().to_string(),
        Phase::Steady => s.green().to_string(),
        Phase::Terminated => s.blue().to_string(),
    }
}

/// Color a termination reason
pub fn color_reason(reason: Option<TerminationReason>) -> String {
    match reason {
        None => "-".to_string(),
        Some(r @ TerminationReason::MaxQpsReached) => r.to_string().green().to_string(),
        Some(r @ TerminationReason::BottleneckConfirmed) => r.to_string().yellow().to_string(),
        Some(r @ TerminationReason::UserAbort) => r.to_string().blue().to_string(),
        Some(r @ TerminationReason::NodeFailure) => r.to_string().red().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_ms() {
        assert_eq!(format_ms(12.34), "12.3ms");
        assert_eq!(format_ms(2500.0), "2.50s");
    }

    #[test]
    fn test_format_qps() {
        assert_eq!(format_qps(Some(2500)), "2500");
        assert_eq!(format_qps(None), "-");
    }

    #[test]
    fn test_color_reason_keeps_text() {
        colored::control::set_override(false);
        assert_eq!(
            color_reason(Some(TerminationReason::BottleneckConfirmed)),
            "bottleneck_confirmed"
        );
        assert_eq!(color_reason(None), "-");
    }
}
