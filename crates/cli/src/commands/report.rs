//! Run directory reports

use anyhow::Result;
use colored::Colorize;
use std::path::Path;
use tabled::Tabled;

use ramp_lib::recorder::{load_run, RecordedRun};
use ramp_lib::{CycleRecord, RunState};

use crate::output::{
    color_phase, color_reason, color_scenario, format_ms, format_percent, format_qps,
    print_json, print_warning, OutputFormat,
};

/// Row for the cycles table
#[derive(Tabled)]
struct CycleRow {
    #[tabled(rename = "Cycle")]
    cycle: u64,
    #[tabled(rename = "Target QPS")]
    target_qps: u64,
    #[tabled(rename = "Achieved")]
    achieved_qps: String,
    #[tabled(rename = "Success")]
    success: String,
    #[tabled(rename = "p99")]
    p99: String,
    #[tabled(rename = "CPU")]
    cpu: String,
    #[tabled(rename = "Height Diff")]
    height_diff: String,
    #[tabled(rename = "Scenario")]
    scenario: String,
    #[tabled(rename = "Streak")]
    streak: u32,
    #[tabled(rename = "Dimensions")]
    dimensions: String,
    #[tabled(rename = "Anomalies")]
    anomalies: String,
}

impl CycleRow {
    fn from_record(record: &CycleRecord) -> Self {
        let join = |items: Vec<String>| {
            if items.is_empty() {
                "-".to_string()
            } else {
                items.join(", ")
            }
        };

        Self {
            cycle: record.cycle_index,
            target_qps: record.load.target_qps,
            achieved_qps: format!("{:.0}", record.load.achieved_qps),
            success: format_percent(record.load.success_rate_percent),
            p99: format_ms(record.load.latency_p99_ms),
            cpu: record
                .resource
                .as_ref()
                .map_or_else(|| "-".to_string(), |r| format_percent(r.cpu_percent)),
            height_diff: record
                .health
                .as_ref()
                .and_then(|h| h.height_diff)
                .map_or_else(|| "-".to_string(), |d| d.to_string()),
            scenario: color_scenario(record.verdict.scenario),
            streak: record.verdict.consecutive_count,
            dimensions: join(
                record
                    .verdict
                    .contributing_dimensions
                    .iter()
                    .map(|d| d.to_string())
                    .collect(),
            ),
            anomalies: join(record.anomalies.iter().map(|a| a.to_string()).collect()),
        }
    }
}

/// Cycles worth a second look
fn is_flagged(record: &CycleRecord) -> bool {
    record.verdict.is_bottleneck || !record.anomalies.is_empty()
}

/// Final state of a run: the summary if one was written, else the last
/// recorded state
fn final_state(run: &RecordedRun) -> Option<&RunState> {
    run.summary
        .as_ref()
        .map(|s| &s.state)
        .or(run.state.as_ref())
}

/// Summarize a run directory
pub fn show_report(run_dir: &Path, flagged_only: bool, format: OutputFormat) -> Result<()> {
    let mut run = load_run(run_dir)?;
    if flagged_only {
        run.cycles.retain(is_flagged);
    }

    match format {
        OutputFormat::Json => print_json(&run)?,
        OutputFormat::Table => {
            println!("{} {}", "Run".bold(), run_dir.display().to_string().cyan());
            println!("{}", "=".repeat(50));

            match final_state(&run) {
                Some(state) => {
                    println!("Phase:                  {}", color_phase(state.phase));
                    println!(
                        "Termination:            {}",
                        color_reason(state.termination_reason)
                    );
                    println!(
                        "Max Successful QPS:     {}",
                        format_qps(state.max_successful_qps).green()
                    );
                    println!("Cycles Evaluated:       {}", state.cycles_evaluated);
                }
                None => print_warning("No run state recorded"),
            }

            match &run.summary {
                Some(summary) => {
                    let elapsed = summary.finished_at - summary.started_at;
                    println!(
                        "Duration:               {}m {}s",
                        elapsed.num_minutes(),
                        elapsed.num_seconds() % 60
                    );
                    if let Some(error) = &summary.fatal_error {
                        println!("Fatal Error:            {}", error.red());
                    }
                }
                None => print_warning("No summary; the run is still going or did not finish"),
            }
            println!();

            if run.cycles.is_empty() {
                print_warning("No cycles recorded");
                return Ok(());
            }

            let rows: Vec<CycleRow> = run.cycles.iter().map(CycleRow::from_record).collect();
            let table = tabled::Table::new(rows)
                .with(tabled::settings::Style::rounded())
                .to_string();
            println!("{}", table);
            println!("\nTotal: {} cycles", run.cycles.len());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ramp_lib::{
        BottleneckVerdict, CycleAnomaly, DimensionKind, HealthSample, LoadResult, MaxQps,
        ResourceSample, Scenario,
    };
    use std::collections::BTreeSet;

    fn record(index: u64, scenario: Scenario, anomalies: Vec<CycleAnomaly>) -> CycleRecord {
        let now = Utc::now();
        let mut health = HealthSample::healthy(now);
        health.height_diff = Some(4);
        let mut resource = ResourceSample::idle(now);
        resource.cpu_percent = 91.5;

        CycleRecord {
            cycle_index: index,
            timestamp: now,
            load: LoadResult::new(2000, 1987.4, 99.5, 0.5, 10.0, 240.0, 60.0),
            resource: Some(resource),
            health: Some(health),
            verdict: BottleneckVerdict {
                cycle_index: index,
                is_bottleneck: scenario != Scenario::Normal
                    && scenario != Scenario::ResourceFalsePositive,
                scenario,
                contributing_dimensions: BTreeSet::from([DimensionKind::Cpu]),
                consecutive_count: 1,
                unhealthy_streak: 0,
            },
            anomalies,
        }
    }

    #[test]
    fn test_cycle_row() {
        colored::control::set_override(false);
        let row = CycleRow::from_record(&record(
            3,
            Scenario::ResourceFalsePositive,
            vec![CycleAnomaly::ResourceFalsePositive],
        ));

        assert_eq!(row.cycle, 3);
        assert_eq!(row.achieved_qps, "1987");
        assert_eq!(row.cpu, "91.5%");
        assert_eq!(row.height_diff, "4");
        assert_eq!(row.dimensions, "cpu");
        assert_eq!(row.anomalies, "resource_false_positive");
    }

    #[test]
    fn test_flagged_cycles() {
        assert!(!is_flagged(&record(1, Scenario::Normal, vec![])));
        assert!(is_flagged(&record(2, Scenario::RpcViolation, vec![])));
        assert!(is_flagged(&record(
            3,
            Scenario::Normal,
            vec![CycleAnomaly::Inconclusive]
        )));
    }

    #[test]
    fn test_final_state_falls_back_to_recorded_state() {
        let state = RunState::new(1000, 500, MaxQps::Bounded(3000));
        let run = RecordedRun {
            cycles: vec![],
            state: Some(state.clone()),
            summary: None,
        };

        assert_eq!(final_state(&run), Some(&state));
        assert_eq!(final_state(&RecordedRun::default()), None);
    }
}
