// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! Container sandbox runtime.
//!
//! Runs the agent CLI inside a single-use container: network disabled
//! unless the agent kind requires it, non-root user, fresh workspace and
//! home bind mounts, memory and CPU caps, wall-clock timeout with a
//! forced kill. Logs are followed line-by-line and scanned for the
//! completion sentinel exactly like the process runtime.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::ContainerCreateBody;
use bollard::query_parameters::{
    CreateContainerOptions, KillContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::output::{self, LogScanner, ScanControl};
use super::{
    collect_artifacts, flush_logs, stage_workspace_files, AgentInvocation, AgentOutcome,
    AgentStatus, SandboxRuntime, OUT_DIR,
};
use crate::application::task_store::TaskStore;
use crate::config::SandboxConfig;
use crate::domain::error::ServerError;

const WORKSPACE_MOUNT: &str = "/workspace/agent-work";
const HOME_MOUNT: &str = "/home/agent";
const SANDBOX_USER: &str = "agent";
const STDIN_FILE: &str = ".stdin_input";

/// Quote one argument for `sh -c`. Input files are staged by the
/// runtime itself, so only CLI arguments (the prompt, flags) pass
/// through here.
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

fn shell_command(invocation: &AgentInvocation) -> String {
    let args = invocation
        .args
        .iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ");
    let base = format!("{} {args}", invocation.command);
    if invocation.stdin_input.is_some() {
        format!("cat {WORKSPACE_MOUNT}/{STDIN_FILE} | {base}")
    } else {
        base
    }
}

pub struct ContainerRuntime {
    docker: Docker,
    config: SandboxConfig,
}

impl ContainerRuntime {
    pub fn new(config: SandboxConfig) -> Result<Self, ServerError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            ServerError::Sandbox(format!(
                "failed to connect to container daemon: {e}. \
                 Ensure the daemon is running and the socket is accessible."
            ))
        })?;
        Ok(Self { docker, config })
    }

    /// Verify the daemon is reachable.
    pub async fn healthcheck(&self) -> Result<(), ServerError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| ServerError::Sandbox(format!("container daemon unreachable: {e}")))
    }

    fn container_config(
        &self,
        invocation: &AgentInvocation,
        workspace: &std::path::Path,
        home: &std::path::Path,
    ) -> ContainerCreateBody {
        let network_mode = if invocation.requires_network && self.config.allow_network {
            "bridge"
        } else {
            "none"
        };

        let mut env: Vec<String> = vec![
            "CI=1".into(),
            "NO_COLOR=1".into(),
            format!("HOME={HOME_MOUNT}"),
            format!("USER={SANDBOX_USER}"),
            "TERM=xterm".into(),
        ];
        for (key, value) in &invocation.env {
            env.push(format!("{key}={value}"));
        }

        let host_config = bollard::service::HostConfig {
            binds: Some(vec![
                format!("{}:{WORKSPACE_MOUNT}:rw", workspace.display()),
                format!("{}:{HOME_MOUNT}:rw", home.display()),
            ]),
            network_mode: Some(network_mode.to_string()),
            memory: Some(self.config.memory_bytes as i64),
            nano_cpus: Some((self.config.cpus * 1_000_000_000.0) as i64),
            ..Default::default()
        };

        ContainerCreateBody {
            image: Some(self.config.image.clone()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                shell_command(invocation),
            ]),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            user: Some(SANDBOX_USER.to_string()),
            env: Some(env),
            host_config: Some(host_config),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        }
    }

    async fn remove_container(&self, id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(id, Some(options)).await {
            tracing::warn!(container = %id, error = %e, "container removal failed");
        }
    }

    async fn kill_container(&self, id: &str) {
        if let Err(e) = self
            .docker
            .kill_container(id, None::<KillContainerOptions>)
            .await
        {
            tracing::warn!(container = %id, error = %e, "container kill failed");
        }
    }
}

#[async_trait]
impl SandboxRuntime for ContainerRuntime {
    async fn execute_agent(
        &self,
        invocation: AgentInvocation,
        task_store: Option<Arc<TaskStore>>,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome, ServerError> {
        let started = Instant::now();

        // TempDir removes the whole tree on drop, panics included.
        let root = tempfile::tempdir()
            .map_err(|e| ServerError::Sandbox(format!("workspace create failed: {e}")))?;
        let workspace = root.path().join("workspace");
        let home = root.path().join("home");
        std::fs::create_dir_all(workspace.join(OUT_DIR))
            .and_then(|_| std::fs::create_dir_all(&home))
            .map_err(|e| ServerError::Sandbox(format!("workspace layout failed: {e}")))?;

        stage_workspace_files(&workspace, &invocation.workspace_files)?;
        if let Some(input) = &invocation.stdin_input {
            std::fs::write(workspace.join(STDIN_FILE), input)
                .map_err(|e| ServerError::Sandbox(format!("stdin staging failed: {e}")))?;
        }

        let options = CreateContainerOptions {
            name: Some(format!("agent-{}", invocation.operation_id)),
            platform: String::new(),
        };
        let config = self.container_config(&invocation, &workspace, &home);

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| ServerError::Sandbox(format!("container create failed: {e}")))?;
        let container_id = created.id;

        if let Err(e) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions>)
            .await
        {
            self.remove_container(&container_id).await;
            return Err(ServerError::Sandbox(format!(
                "container start failed: {e}"
            )));
        }

        tracing::info!(
            agent = %invocation.agent_kind,
            operation_id = %invocation.operation_id,
            container = %container_id,
            "agent container started"
        );

        let mut log_stream = self.docker.logs(
            &container_id,
            Some(LogsOptions {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let mut scanner = LogScanner::new(self.config.max_stdout_bytes);
        let mut batch: Vec<String> = Vec::new();
        let mut pending = String::new();
        let deadline = tokio::time::Instant::now() + self.config.timeout;
        let mut timed_out = false;
        let mut cancelled = false;

        'stream: loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
                chunk = log_stream.next() => chunk,
            };

            let message = match chunk {
                Some(Ok(LogOutput::StdOut { message }))
                | Some(Ok(LogOutput::StdErr { message }))
                | Some(Ok(LogOutput::Console { message })) => message,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "container log stream failed");
                    break;
                }
                None => break,
            };

            // Log frames are not line-aligned; reassemble before
            // feeding the scanner.
            pending.push_str(&String::from_utf8_lossy(&message));
            while let Some(newline) = pending.find('\n') {
                let line: String = pending.drain(..=newline).collect();
                let line = line.trim_end_matches('\n');
                batch.push(line.to_string());
                flush_logs(&task_store, &invocation.operation_id, &mut batch, false);
                if scanner.push_line(line) == ScanControl::Stop {
                    break 'stream;
                }
            }
        }
        if !pending.is_empty() && !timed_out && !cancelled {
            batch.push(pending.clone());
            scanner.push_line(&pending);
        }
        flush_logs(&task_store, &invocation.operation_id, &mut batch, true);

        if timed_out || cancelled {
            self.kill_container(&container_id).await;
        }

        // Exit code, waiting briefly for a finished container.
        let mut wait_stream = self
            .docker
            .wait_container(&container_id, None::<WaitContainerOptions>);
        let exit_code = match tokio::time::timeout(
            std::time::Duration::from_secs(5),
            wait_stream.next(),
        )
        .await
        {
            Ok(Some(Ok(response))) => Some(response.status_code),
            Ok(_) => None,
            Err(_) => {
                self.kill_container(&container_id).await;
                None
            }
        };

        self.remove_container(&container_id).await;

        let artifacts = collect_artifacts(&workspace, false);

        let stdout_text = output::redact(
            &scanner.lines().join("\n"),
            invocation.redact_key.as_deref(),
        );
        let sentinel_seen = scanner.sentinel_seen();
        let parsed = output::parse_agent_result(scanner.lines());

        let mut logs = Vec::new();
        let (status, summary) = if timed_out {
            logs.push(format!("timeout after {}s", self.config.timeout.as_secs()));
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
            "agent container finished"
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
