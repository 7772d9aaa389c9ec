//! Remote procedures backed by external commands.
//!
//! The resolved step input is written to the command's stdin as JSON and
//! its stdout is parsed as the step output. A non-zero exit fails the step.

use anyhow::{Context, Result};
use keel_core::workflow::{RpcInvoker, StepWire};
use keel_core::RpcFailure;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Exit code a command uses to ask for the run to be suspended
pub const SUSPEND_EXIT_CODE: i32 = 75;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

pub struct CommandRpcInvoker {
    commands: HashMap<String, RpcCommand>,
}

impl CommandRpcInvoker {
    pub fn new(commands: HashMap<String, RpcCommand>) -> Self {
        Self { commands }
    }
}

#[async_trait::async_trait]
impl RpcInvoker for CommandRpcInvoker {
    async fn invoke(&self, rpc_name: &str, input: Value, wire: &mut StepWire) -> Result<Value> {
        let rpc = self
            .commands
            .get(rpc_name)
            .ok_or_else(|| {
                RpcFailure::new(
                    "RPC_NOT_CONFIGURED",
                    format!("No command configured for RPC '{}'", rpc_name),
                )
            })?;

        tracing::debug!(
            "Invoking {} via {} (run {}, step {}, attempt {})",
            rpc_name,
            rpc.command,
            wire.run_id(),
            wire.step_id(),
            wire.attempt()
        );

        let mut child = Command::new(&rpc.command)
            .args(&rpc.args)
            .env("KEEL_RUN_ID", wire.run_id().to_string())
            .env("KEEL_STEP_ID", wire.step_id())
            .env("KEEL_ATTEMPT", wire.attempt().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", rpc.command))?;

        let payload = serde_json::to_vec(&input).context("Failed to encode RPC input")?;
        let stdin = child.stdin.take();
        let write_input = async move {
            if let Some(mut stdin) = stdin {
                // Commands that ignore their input may exit before reading it
                if let Err(e) = stdin.write_all(&payload).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        return Err(e);
                    }
                }
            }
            Ok::<(), std::io::Error>(())
        };

        // Feed stdin while draining stdout and stderr, or a child that fills
        // its output pipe blocks on us as we block on it
        let (written, output) = tokio::join!(write_input, child.wait_with_output());
        let output = output.with_context(|| format!("Failed to wait for {}", rpc.command))?;
        written.context("Failed to write RPC input")?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if output.status.code() == Some(SUSPEND_EXIT_CODE) {
            let reason = stderr.trim();
            wire.suspend(if reason.is_empty() { rpc_name } else { reason });
            return Ok(Value::Null);
        }

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| format!("EXIT_{}", c))
                .unwrap_or_else(|| "KILLED".to_string());
            let message = match stderr.trim() {
                "" => format!("{} exited with {}", rpc.command, output.status),
                trimmed => trimmed.to_string(),
            };
            return Err(RpcFailure::new(code, message).into());
        }

        parse_output(&stdout, wire).with_context(|| format!("Invalid output from {}", rpc.command))
    }
}

/// Empty stdout is a null result. An object carrying a `$branch` key
/// selects the next branch; the rest of the object is the output.
fn parse_output(stdout: &str, wire: &mut StepWire) -> Result<Value> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Value::Null);
    }

    let mut value: Value = serde_json::from_str(trimmed)?;
    if let Some(object) = value.as_object_mut() {
        if let Some(branch) = object.remove("$branch") {
            match branch {
                Value::String(key) => wire.branch(key),
                other => wire.branch(other.to_string()),
            }
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::RunId;
    use serde_json::json;

    fn shell(script: &str) -> RpcCommand {
        RpcCommand {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn invoker(rpc_name: &str, script: &str) -> CommandRpcInvoker {
        CommandRpcInvoker::new(HashMap::from([(rpc_name.to_string(), shell(script))]))
    }

    fn wire() -> StepWire {
        StepWire::new(RunId::new(), "step", 1)
    }

    #[tokio::test]
    async fn test_stdin_to_stdout() {
        let invoker = invoker("echo", "cat");
        let mut wire = wire();
        let output = invoker
            .invoke("echo", json!({"orgId": "acme"}), &mut wire)
            .await
            .unwrap();
        assert_eq!(output, json!({"orgId": "acme"}));
        assert!(wire.selected_branch().is_none());
    }

    #[tokio::test]
    async fn test_input_larger_than_pipe_buffer() {
        let invoker = invoker("echo", "cat");
        let blob = "x".repeat(1 << 20);
        let output = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            invoker.invoke("echo", json!({"blob": blob}), &mut wire()),
        )
        .await
        .expect("invoke finished")
        .unwrap();
        assert_eq!(output["blob"].as_str().map(str::len), Some(1 << 20));
    }

    #[tokio::test]
    async fn test_branch_selection() {
        let invoker = invoker("choose", r#"echo '{"$branch": "pro", "seats": 5}'"#);
        let mut wire = wire();
        let output = invoker.invoke("choose", Value::Null, &mut wire).await.unwrap();
        assert_eq!(output, json!({"seats": 5}));
        assert_eq!(wire.selected_branch(), Some("pro"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails() {
        let invoker = invoker("charge", "echo 'card declined' >&2; exit 3");
        let err = invoker
            .invoke("charge", Value::Null, &mut wire())
            .await
            .unwrap_err();
        let failure = err.downcast_ref::<RpcFailure>().unwrap();
        assert_eq!(failure.code, "EXIT_3");
        assert_eq!(failure.message, "card declined");
    }

    #[tokio::test]
    async fn test_suspend_exit_code() {
        let invoker = invoker("approve", "echo 'Needs approval' >&2; exit 75");
        let mut wire = wire();
        let output = invoker.invoke("approve", Value::Null, &mut wire).await.unwrap();
        assert_eq!(output, Value::Null);
        assert_eq!(wire.suspension(), Some("Needs approval"));
    }

    #[tokio::test]
    async fn test_unconfigured_rpc() {
        let invoker = CommandRpcInvoker::new(HashMap::new());
        let err = invoker
            .invoke("missing", Value::Null, &mut wire())
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<RpcFailure>().unwrap().code, "RPC_NOT_CONFIGURED");
    }
}
