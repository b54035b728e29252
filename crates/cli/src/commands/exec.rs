// Execute a single worker command

use anyhow::{bail, Context, Result};
use pyfleet_core::{CheckoutMode, FleetClient};
use serde_json::Value;

use crate::fleet::Fleet;
use crate::output::{print_field, OutputFormat};

pub struct ExecArgs {
    pub command: String,
    pub args: String,
    pub session: Option<String>,
    pub attempts: Option<u32>,
    pub circuit: Option<String>,
}

fn parse_args(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw).context("--args is not valid JSON")?;
    if !value.is_object() {
        bail!("--args must be a JSON object");
    }
    Ok(value)
}

pub async fn run(fleet: &Fleet, output: OutputFormat, exec: ExecArgs) -> Result<()> {
    let args = parse_args(&exec.args)?;

    let mut policy = fleet.retry.clone();
    if let Some(attempts) = exec.attempts {
        policy = policy.with_max_attempts(attempts);
    }
    if let Some(circuit) = exec.circuit {
        policy = policy.with_circuit(circuit);
    }
    let client = FleetClient::new(fleet.pool.clone()).with_retry_policy(policy);

    let mode = match exec.session {
        Some(session) => CheckoutMode::Session(session),
        None => CheckoutMode::AnyWorker,
    };

    match client.execute(mode, &exec.command, args).await {
        Ok(result) => {
            if output.is_text() {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                output.print_value(&result)?;
            }
            Ok(())
        }
        Err(error) => {
            if output.is_text() {
                print_field("Error", error.kind.as_str());
                print_field("Category", &error.category().to_string());
                print_field("Message", &error.message);
                if let Some(worker_id) = &error.context.worker_id {
                    print_field("Worker", worker_id);
                }
                if let Some(attempt) = error.context.attempt {
                    print_field("Attempt", &attempt.to_string());
                }
            } else {
                output.print_value(&error.to_value())?;
            }
            bail!("command '{}' failed", exec.command)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args_requires_object() {
        assert_eq!(parse_args("{\"a\": 1}").unwrap()["a"], 1);
        assert!(parse_args("[1, 2]").is_err());
        assert!(parse_args("not json").is_err());
    }
}
