// Health check command

use anyhow::Result;
use serde_json::json;

use crate::fleet::Fleet;
use crate::output::{print_field, print_table_header, print_table_row, OutputFormat};

pub async fn run(fleet: &Fleet, output: OutputFormat, quiet: bool) -> Result<()> {
    let report = fleet.pool.health_check_all().await;
    let workers = fleet.pool.workers();

    if !output.is_text() {
        return output.print_value(&json!({ "report": report, "workers": workers }));
    }

    if !quiet {
        print_field("Checked", &report.checked.to_string());
        print_field("Healthy", &report.healthy.to_string());
        print_field("Unhealthy", &report.unhealthy.to_string());
        print_field("Recovered", &report.recovered.to_string());
        print_field("Removed", &report.removed.to_string());
        println!();
    }

    if workers.is_empty() {
        println!("No workers");
        return Ok(());
    }

    print_table_header(&[("WORKER", 20), ("STATE", 12), ("HEALTH", 10), ("CHECKS", 8), ("FAILED", 8)]);
    for worker in &workers {
        print_table_row(&[
            (&worker.id, 20),
            (worker.state.as_str(), 12),
            (&worker.health.to_string(), 10),
            (&worker.stats.health_checks.to_string(), 8),
            (&worker.stats.health_failures.to_string(), 8),
        ]);
    }
    Ok(())
}
