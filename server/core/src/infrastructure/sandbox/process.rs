// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! Process sandbox runtime.
//!
//! Runs the agent CLI directly as an OS process for hosts where a
//! container daemon is unavailable. Isolation is coarser than the
//! container runtime but the contract is identical:
//!
//! - workspace is a fresh mode-0700 temp directory, removed
//!   unconditionally on exit;
//! - the child starts in its own session (`setsid`) so a timeout can
//!   kill the whole process group, with `RLIMIT_FSIZE` capping any
//!   single file write;
//! - the environment is cleared down to a minimal safe set plus the
//!   agent's explicit overrides;
//! - a semaphore bounds how many agents run concurrently per instance.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use rand::RngCore;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::output::{self, LogScanner, ScanControl};
use super::{
    collect_artifacts, flush_logs, stage_workspace_files, AgentInvocation, AgentOutcome,
    AgentStatus, SandboxRuntime, OUT_DIR,
};
use crate::application::task_store::TaskStore;
use crate::config::SandboxConfig;
use crate::domain::error::ServerError;

/// Per-write file size cap applied through RLIMIT_FSIZE.
const FILE_SIZE_LIMIT_BYTES: u64 = 100 * 1024 * 1024;

pub struct ProcessRuntime {
    config: SandboxConfig,
    semaphore: Arc<Semaphore>,
}

impl ProcessRuntime {
    pub fn new(config: SandboxConfig) -> Self {
        let permits = config.max_concurrent.max(1);
        Self {
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    fn create_workspace() -> Result<std::path::PathBuf, ServerError> {
        let mut token = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut token);
        let workspace = std::env::temp_dir().join(format!("agent-{}", hex::encode(token)));

        std::fs::create_dir(&workspace)
            .map_err(|e| ServerError::Sandbox(format!("workspace create failed: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&workspace, std::fs::Permissions::from_mode(0o700))
                .map_err(|e| ServerError::Sandbox(format!("workspace chmod failed: {e}")))?;
        }

        std::fs::create_dir(workspace.join(OUT_DIR))
            .map_err(|e| ServerError::Sandbox(format!("workspace out/ create failed: {e}")))?;

        Ok(workspace)
    }

    fn build_command(&self, invocation: &AgentInvocation, workspace: &std::path::Path) -> Command {
        let mut cmd = Command::new(&invocation.command);
        cmd.args(&invocation.args)
            .current_dir(workspace)
            .stdin(if invocation.stdin_input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Minimal environment: nothing inherited beyond PATH, plus the
        // agent's explicit overrides.
        cmd.env_clear();
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        cmd.env("HOME", workspace)
            .env("CI", "1")
            .env("NO_COLOR", "1")
            .env("TERM", "xterm");
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // New session so the group can be killed as a unit.
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    let limit = libc::rlimit {
                        rlim_cur: FILE_SIZE_LIMIT_BYTES,
                        rlim_max: FILE_SIZE_LIMIT_BYTES,
                    };
                    if libc::setrlimit(libc::RLIMIT_FSIZE, &limit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        cmd
    }

    #[cfg(unix)]
    fn kill_process_group(pid: u32) {
        unsafe {
            libc::killpg(pid as i32, libc::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    fn kill_process_group(_pid: u32) {}
}

#[async_trait]
impl SandboxRuntime for ProcessRuntime {
    async fn execute_agent(
        &self,
        invocation: AgentInvocation,
        task_store: Option<Arc<TaskStore>>,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome, ServerError> {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ServerError::Sandbox("sandbox semaphore closed".into()))?;

        let started = Instant::now();
        let workspace = Self::create_workspace()?;

        // Workspace removal must survive every exit path, panics and
        // timeouts included.
        let workspace_guard = workspace.clone();
        let _cleanup = scopeguard::guard((), move |_| {
            if let Err(e) = std::fs::remove_dir_all(&workspace_guard) {
                tracing::warn!(error = %e, "workspace cleanup failed");
            }
        });

        stage_workspace_files(&workspace, &invocation.workspace_files)?;

        let mut child = self
            .build_command(&invocation, &workspace)
            .spawn()
            .map_err(|e| {
                ServerError::Sandbox(format!("failed to spawn {}: {e}", invocation.command))
            })?;

        let pid = child.id();
        tracing::info!(
            agent = %invocation.agent_kind,
            operation_id = %invocation.operation_id,
            pid,
            "agent process started"
        );

        if let Some(input) = &invocation.stdin_input {
            if let Some(mut stdin) = child.stdin.take() {
                let bytes = input.clone().into_bytes();
                // The agent may exit before consuming stdin; a broken
                // pipe here is not a runtime failure.
                tokio::spawn(async move {
                    let _ = stdin.write_all(&bytes).await;
                });
            }
        }

        // Stderr drains concurrently so the child cannot block on a
        // full pipe; lines surface in the outcome logs.
        let stderr_lines: Arc<parking_lot::Mutex<Vec<String>>> = Arc::new(Default::default());
        if let Some(stderr) = child.stderr.take() {
            let sink = stderr_lines.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    tracing::debug!(target: "agent.stderr", "{line}");
                    sink.lock().push(line);
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ServerError::Sandbox("agent stdout unavailable".into()))?;
        let mut reader = BufReader::new(stdout).lines();

        let mut scanner = LogScanner::new(self.config.max_stdout_bytes);
        let mut batch: Vec<String> = Vec::new();
        let deadline = tokio::time::Instant::now() + self.config.timeout;
        let mut timed_out = false;
        let mut cancelled = false;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
                line = reader.next_line() => line,
            };

            match next {
                Ok(Some(line)) => {
                    batch.push(line.clone());
                    flush_logs(&task_store, &invocation.operation_id, &mut batch, false);
                    if scanner.push_line(&line) == ScanControl::Stop {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "agent stdout read failed");
                    break;
                }
            }
        }
        flush_logs(&task_store, &invocation.operation_id, &mut batch, true);

        if timed_out || cancelled {
            if let Some(pid) = pid {
                Self::kill_process_group(pid);
            }
            let _ = child.kill().await;
        }

        // Give a finished agent a moment to exit; anything still alive
        // after the grace period is killed with its group.
        let exit_code = match tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
            .await
        {
            Ok(Ok(status)) => status.code().map(i64::from),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "agent wait failed");
                None
            }
            Err(_) => {
                if let Some(pid) = pid {
                    Self::kill_process_group(pid);
                }
                let _ = child.wait().await;
                None
            }
        };

        let mut logs: Vec<String> = stderr_lines.lock().drain(..).collect();
        let artifacts = collect_artifacts(&workspace, true);

        let stdout_text = output::redact(
            &scanner.lines().join("\n"),
            invocation.redact_key.as_deref(),
        );
        let sentinel_seen = scanner.sentinel_seen();
        let parsed = output::parse_agent_result(scanner.lines());

        let (status, summary) = if timed_out {
            logs.push(format!(
                "timeout after {}s",
                self.config.timeout.as_secs()
            ));
            (AgentStatus::Error, "timeout".to_string())
        } else if cancelled {
            (AgentStatus::Error, "cancelled".to_string())
        } else {
            output::assess(parsed.as_ref(), sentinel_seen, exit_code)
        };

        tracing::info!(
            operation_id = %invocation.operation_id,
            status = status.as_str(),
            exit_code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "agent process finished"
        );

        Ok(AgentOutcome {
            status,
            summary,
            structured_result: parsed,
            artifacts,
            logs,
            stdout_excerpt: stdout_text,
            return_code: exit_code,
            execution_time: started.elapsed(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn config(timeout: Duration) -> SandboxConfig {
        SandboxConfig {
            timeout,
            max_concurrent: 2,
            ..SandboxConfig::default()
        }
    }

    fn invocation(script: &str) -> AgentInvocation {
        AgentInvocation {
            agent_kind: "stub".into(),
            command: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            workspace_files: vec![("input.txt".into(), b"hello".to_vec())],
            env: HashMap::new(),
            operation_id: "stub_1".into(),
            stdin_input: None,
            requires_network: false,
            redact_key: None,
        }
    }

    #[tokio::test]
    async fn successful_agent_with_artifact() {
        let runtime = ProcessRuntime::new(config(Duration::from_secs(20)));
        let script = r#"
            printf 'ok' > out/r.txt
            echo '{"status":"ok","summary":"done","artifacts":["out/r.txt"]}'
            echo '__AGENT_DONE__'
        "#;

        let outcome = runtime
            .execute_agent(invocation(script), None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, AgentStatus::Ok);
        assert_eq!(outcome.summary, "done");
        assert_eq!(outcome.artifacts.len(), 1);
        assert_eq!(outcome.artifacts[0].relative_path, "out/r.txt");
        assert_eq!(outcome.artifacts[0].bytes, b"ok");
    }

    #[tokio::test]
    async fn workspace_is_removed_after_run() {
        let runtime = ProcessRuntime::new(config(Duration::from_secs(20)));
        let script = r#"
            pwd
            echo '{"status":"ok","summary":"noted"}'
            echo '__AGENT_DONE__'
        "#;

        let outcome = runtime
            .execute_agent(invocation(script), None, CancellationToken::new())
            .await
            .unwrap();

        // First streamed line is the workspace path printed by `pwd`.
        let workspace = outcome
            .stdout_excerpt
            .lines()
            .next()
            .expect("pwd output")
            .trim()
            .to_string();
        assert!(workspace.contains("agent-"));
        assert!(!std::path::Path::new(&workspace).exists());
    }

    #[tokio::test]
    async fn timeout_kills_agent_and_cleans_up() {
        let runtime = ProcessRuntime::new(config(Duration::from_millis(300)));
        let script = r#"
            pwd
            sleep 30
            echo '__AGENT_DONE__'
        "#;

        let started = Instant::now();
        let outcome = runtime
            .execute_agent(invocation(script), None, CancellationToken::new())
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(outcome.status, AgentStatus::Error);
        assert_eq!(outcome.summary, "timeout");

        let workspace = outcome
            .stdout_excerpt
            .lines()
            .next()
            .expect("pwd output")
            .trim()
            .to_string();
        assert!(!std::path::Path::new(&workspace).exists());
    }

    #[tokio::test]
    async fn sentinel_without_json_is_warning() {
        let runtime = ProcessRuntime::new(config(Duration::from_secs(20)));
        let script = r#"
            echo 'did some work'
            echo '__AGENT_DONE__'
        "#;

        let outcome = runtime
            .execute_agent(invocation(script), None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, AgentStatus::Warning);
    }

    #[tokio::test]
    async fn nonzero_exit_without_sentinel_is_error() {
        let runtime = ProcessRuntime::new(config(Duration::from_secs(20)));
        let outcome = runtime
            .execute_agent(invocation("exit 3"), None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, AgentStatus::Error);
        assert_eq!(outcome.return_code, Some(3));
    }

    #[tokio::test]
    async fn stdin_is_piped_to_the_agent() {
        let runtime = ProcessRuntime::new(config(Duration::from_secs(20)));
        let mut inv = invocation(
            r#"
            read first_line
            echo "{\"status\":\"ok\",\"summary\":\"$first_line\"}"
            echo '__AGENT_DONE__'
        "#,
        );
        inv.stdin_input = Some("from stdin\n".into());

        let outcome = runtime
            .execute_agent(inv, None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.summary, "from stdin");
    }

    #[tokio::test]
    async fn cancellation_token_stops_the_agent() {
        let runtime = ProcessRuntime::new(config(Duration::from_secs(30)));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = runtime
            .execute_agent(invocation("sleep 30"), None, cancel)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(outcome.status, AgentStatus::Error);
        assert_eq!(outcome.summary, "cancelled");
    }

    #[tokio::test]
    async fn streams_logs_into_task_store() {
        let runtime = ProcessRuntime::new(config(Duration::from_secs(20)));
        let store = Arc::new(TaskStore::default());
        store.create("stub_1");

        let script = r#"
            for i in 1 2 3 4 5 6 7 8 9 10 11 12; do echo "line $i"; done
            echo '__AGENT_DONE__'
        "#;
        runtime
            .execute_agent(invocation(script), Some(store.clone()), CancellationToken::new())
            .await
            .unwrap();

        let snapshot = store.get("stub_1").unwrap();
        assert!(snapshot.logs.iter().any(|l| l == "line 1"));
        assert!(snapshot.logs.iter().any(|l| l == "line 12"));
    }
}
