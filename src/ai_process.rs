//! Runs an external AI CLI as an opaque subprocess: spawn it, feed it a
//! prompt, stream its output back, never block stdout on stderr or vice
//! versa (spec.md 5 forbids draining one only after the child exits).

use crate::{RalphError, Result};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// How to invoke the AI binary for one phase.
#[derive(Debug, Clone)]
pub struct AiProcessSpec {
    pub executable: String,
    pub arguments: Vec<String>,
    pub working_dir: std::path::PathBuf,
    pub uses_stdin: bool,
    pub uses_prompt_argument: bool,
    pub uses_stream_json: bool,
    pub timeout: Duration,
}

/// Outcome of one subprocess invocation.
#[derive(Debug, Clone)]
pub struct AiProcessResult {
    pub success: bool,
    pub output: String,
    pub parsed_text: String,
    pub error: Option<String>,
    pub duration: Duration,
    pub output_chars: usize,
}

/// One `stream-json` event line; only the fields this crate cares about
/// (a text delta) are modeled, everything else is ignored.
#[derive(Debug, serde::Deserialize)]
struct StreamEvent {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    delta: Option<String>,
}

/// Spawns `spec.executable`, writes `prompt` per the configured input
/// mode, and drains stdout/stderr concurrently so neither stream's
/// buffer can fill and deadlock the child. Wrapped in `timeout`.
pub async fn run(spec: &AiProcessSpec, prompt: &str) -> Result<AiProcessResult> {
    let started = Instant::now();

    let mut command = Command::new(&spec.executable);
    command
        .args(&spec.arguments)
        .current_dir(&spec.working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if spec.uses_prompt_argument {
        command.arg(prompt);
    }

    let mut child = command.spawn().map_err(|e| RalphError::Subprocess {
        message: format!("failed to spawn {}: {e}", spec.executable),
    })?;

    if spec.uses_stdin {
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.to_string();
            stdin.write_all(prompt.as_bytes()).await.map_err(|e| RalphError::Subprocess {
                message: format!("failed to write prompt to stdin: {e}"),
            })?;
            stdin.flush().await.map_err(|e| RalphError::Subprocess {
                message: format!("failed to flush stdin: {e}"),
            })?;
        }
    }
    drop(child.stdin.take());

    let stdout = child.stdout.take().ok_or_else(|| RalphError::Subprocess {
        message: "child stdout was not piped".to_string(),
    })?;
    let stderr = child.stderr.take().ok_or_else(|| RalphError::Subprocess {
        message: "child stderr was not piped".to_string(),
    })?;

    let uses_stream_json = spec.uses_stream_json;
    let stdout_task = tokio::spawn(async move {
        let mut reader = BufReader::new(stdout).lines();
        let mut raw = String::new();
        let mut parsed_text = String::new();
        while let Ok(Some(line)) = reader.next_line().await {
            raw.push_str(&line);
            raw.push('\n');
            if uses_stream_json {
                if let Ok(event) = serde_json::from_str::<StreamEvent>(&line) {
                    if let Some(text) = event.text.or(event.delta) {
                        parsed_text.push_str(&text);
                    }
                }
            }
        }
        (raw, parsed_text)
    });

    let stderr_task = tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        let mut raw = String::new();
        while let Ok(Some(line)) = reader.next_line().await {
            debug!("subprocess stderr: {}", line);
            raw.push_str(&line);
            raw.push('\n');
        }
        raw
    });

    let run_future = async {
        let status = child.wait().await.map_err(|e| RalphError::Subprocess {
            message: format!("failed to wait for child: {e}"),
        })?;
        let (stdout_raw, parsed_text) = stdout_task
            .await
            .map_err(|e| RalphError::Internal(anyhow::anyhow!("stdout task join error: {e}")))?;
        let stderr_raw = stderr_task
            .await
            .map_err(|e| RalphError::Internal(anyhow::anyhow!("stderr task join error: {e}")))?;
        Result::<(std::process::ExitStatus, String, String, String)>::Ok((
            status,
            stdout_raw,
            parsed_text,
            stderr_raw,
        ))
    };

    let outcome = tokio::time::timeout(spec.timeout, run_future).await;

    let elapsed = started.elapsed();
    match outcome {
        Ok(Ok((status, stdout_raw, parsed_text, stderr_raw))) => {
            let output_chars = stdout_raw.chars().count();
            if status.success() {
                Ok(AiProcessResult {
                    success: true,
                    output: stdout_raw,
                    parsed_text,
                    error: None,
                    duration: elapsed,
                    output_chars,
                })
            } else {
                warn!(executable = %spec.executable, "subprocess exited with failure");
                Ok(AiProcessResult {
                    success: false,
                    output: stdout_raw,
                    parsed_text,
                    error: Some(if stderr_raw.is_empty() {
                        format!("exited with status {status}")
                    } else {
                        stderr_raw
                    }),
                    duration: elapsed,
                    output_chars,
                })
            }
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            let _ = child.start_kill();
            Err(RalphError::SubprocessTimeout {
                seconds: spec.timeout.as_secs(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(executable: &str, arguments: Vec<&str>) -> AiProcessSpec {
        AiProcessSpec {
            executable: executable.to_string(),
            arguments: arguments.into_iter().map(String::from).collect(),
            working_dir: std::env::temp_dir(),
            uses_stdin: false,
            uses_prompt_argument: false,
            uses_stream_json: false,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn captures_stdout_on_success() {
        let spec = spec("sh", vec!["-c", "echo hello"]);
        let result = run(&spec, "").await.unwrap();
        assert!(result.success);
        assert!(result.output.contains("hello"));
    }

    #[tokio::test]
    async fn reports_failure_on_nonzero_exit() {
        let spec = spec("sh", vec!["-c", "echo boom >&2; exit 1"]);
        let result = run(&spec, "").await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn times_out_on_slow_process() {
        let mut spec = spec("sh", vec!["-c", "sleep 5"]);
        spec.timeout = Duration::from_millis(100);
        let result = run(&spec, "").await;
        assert!(matches!(result, Err(RalphError::SubprocessTimeout { .. })));
    }

    #[tokio::test]
    async fn drains_large_stderr_without_deadlock() {
        let spec = spec("sh", vec!["-c", "yes x | head -c 200000 >&2; echo done"]);
        let result = run(&spec, "").await.unwrap();
        assert!(result.success);
        assert!(result.output.contains("done"));
    }

    #[tokio::test]
    async fn writes_prompt_to_stdin_when_enabled() {
        let mut spec = spec("cat", vec![]);
        spec.uses_stdin = true;
        let result = run(&spec, "echo this back").await.unwrap();
        assert!(result.success);
        assert!(result.output.contains("echo this back"));
    }
}
