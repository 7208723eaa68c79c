//! Live run status

use anyhow::Result;
use colored::Colorize;
use ramp_lib::RunState;

use crate::client::ApiClient;
use crate::output::{color_phase, color_reason, format_qps, print_info, print_json, OutputFormat};

/// Show the state of the running ramp
pub async fn show_status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let state: RunState = client.get("status").await?;

    match format {
        OutputFormat::Json => print_json(&state)?,
        OutputFormat::Table => {
            println!("{}", "Ramp Status".bold());
            println!("{}", "=".repeat(50));
            println!("Phase:                  {}", color_phase(state.phase));
            println!(
                "Current QPS:            {}",
                state.current_qps.to_string().cyan()
            );
            println!("Step:                   {}", state.step_size);
            println!("Max QPS:                {}", state.max_qps);
            println!();
            println!("{}", "Progress".bold());
            println!("{}", "-".repeat(50));
            println!("Cycles Evaluated:       {}", state.cycles_evaluated);
            println!(
                "Max Successful QPS:     {}",
                format_qps(state.max_successful_qps)
            );
            println!(
                "Consecutive Bottlenecks: {}",
                state.consecutive_bottleneck_count
            );
            println!("Unhealthy Streak:       {}", state.unhealthy_streak);
            println!(
                "Termination:            {}",
                color_reason(state.termination_reason)
            );
            println!(
                "Updated:                {}",
                state.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
            );

            if !state.is_terminated() {
                println!();
                print_info("Use `rampctl abort` to stop the run before its next level.");
            }
        }
    }

    Ok(())
}
