//! Abort a running ramp

use anyhow::Result;

use crate::client::{AbortResponse, ApiClient};
use crate::output::{print_info, print_json, print_success, print_warning, OutputFormat};

/// Ask the runner to stop before its next level
pub async fn abort_run(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let response: AbortResponse = client.post("abort", &serde_json::json!({})).await?;

    match format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => {
            if response.accepted {
                print_success(&response.message);
                print_info("The level in progress runs to completion before the run stops.");
            } else {
                print_warning(&response.message);
            }
        }
    }

    Ok(())
}
