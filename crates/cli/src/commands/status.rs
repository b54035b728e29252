// Pool status command

use anyhow::Result;
use pyfleet_core::WorkerInfo;
use serde_json::json;

use crate::fleet::Fleet;
use crate::output::{print_field, print_table_header, print_table_row, OutputFormat};

pub fn run(fleet: &Fleet, output: OutputFormat, quiet: bool, history: bool) -> Result<()> {
    let status = fleet.pool.status();
    let mut workers = fleet.pool.workers();
    if !history {
        for worker in &mut workers {
            worker.history.clear();
        }
    }

    if !output.is_text() {
        return output.print_value(&json!({ "pool": status, "workers": workers }));
    }

    if !quiet {
        print_field("Pool", &status.name);
        print_field(
            "Workers",
            &format!("{} (size {}, overflow {}/{})", status.workers, status.size, status.overflow_workers, status.max_overflow),
        );
        print_field("Available", &status.available.to_string());
        let states = status
            .by_state
            .iter()
            .map(|(state, count)| format!("{state}={count}"))
            .collect::<Vec<_>>()
            .join(", ");
        print_field("States", if states.is_empty() { "-" } else { states.as_str() });
        print_field("Sessions", &status.active_sessions.to_string());
        print_field("Migrating", &status.migrations_in_progress.to_string());
        print_field("Anomalies", &status.correlation_anomalies.to_string());
        for circuit in &status.circuits {
            print_field(
                &format!("Circuit {}", circuit.name),
                &format!("{} (failures {})", circuit.state, circuit.failure_count),
            );
        }
        println!();
    }

    print_workers(&workers);
    if history {
        for worker in &workers {
            println!();
            println!("{}:", worker.id);
            for record in &worker.history {
                println!("  {}  {} -> {}  {}", record.at.to_rfc3339(), record.from, record.to, record.reason);
            }
        }
    }
    Ok(())
}

fn print_workers(workers: &[WorkerInfo]) {
    if workers.is_empty() {
        println!("No workers");
        return;
    }
    print_table_header(&[("WORKER", 20), ("STATE", 12), ("PID", 8), ("CHECKOUTS", 10), ("FAILS", 6), ("SESSIONS", 8)]);
    for worker in workers {
        let pid = worker.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        print_table_row(&[
            (&worker.id, 20),
            (worker.state.as_str(), 12),
            (&pid, 8),
            (&worker.stats.checkouts.to_string(), 10),
            (&worker.consecutive_failures.to_string(), 6),
            (&worker.sessions.len().to_string(), 8),
        ]);
    }
}
