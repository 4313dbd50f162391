// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! Sandbox runtimes for agent CLIs.
//!
//! Two interchangeable isolation layers run untrusted agents: a
//! container runtime (network/user/filesystem isolation with memory and
//! CPU caps) and a process runtime (rlimits, private workspace,
//! concurrency semaphore) for hosts without a container daemon. Both
//! honor the same contract: stage input files into a fresh workspace,
//! stream stdout line-by-line into the task store, stop at the
//! completion sentinel, collect artifacts from `out/`, and delete the
//! workspace no matter how execution ended.

pub mod container;
pub mod output;
pub mod process;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::application::task_store::TaskStore;
use crate::config::{SandboxConfig, SandboxKind};
use crate::domain::error::ServerError;
use crate::domain::path_guard;

/// Subdirectory of the workspace agents write artifacts into.
pub const OUT_DIR: &str = "out";

/// How many streamed lines accumulate before a task-store append.
const LOG_BATCH: usize = 10;

#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub agent_kind: String,
    pub command: String,
    pub args: Vec<String>,
    /// Filename → content; names are validated against the workspace
    /// root before staging.
    pub workspace_files: Vec<(String, Vec<u8>)>,
    pub env: HashMap<String, String>,
    pub operation_id: String,
    /// Piped to the agent's stdin when present (long prompts).
    pub stdin_input: Option<String>,
    /// Agents that call remote inference APIs need egress; everything
    /// else runs with networking disabled where the runtime can.
    pub requires_network: bool,
    /// Key material to scrub from captured output.
    pub redact_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Ok,
    Warning,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Ok => "ok",
            AgentStatus::Warning => "warning",
            AgentStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectedArtifact {
    pub name: String,
    pub bytes: Vec<u8>,
    pub size: usize,
    pub relative_path: String,
}

#[derive(Debug)]
pub struct AgentOutcome {
    pub status: AgentStatus,
    pub summary: String,
    pub structured_result: Option<Value>,
    pub artifacts: Vec<CollectedArtifact>,
    pub logs: Vec<String>,
    pub stdout_excerpt: String,
    pub return_code: Option<i64>,
    pub execution_time: Duration,
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Run one agent to completion. `Err` means the runtime itself
    /// failed; agent-reported failures come back as an outcome with
    /// `status == Error`.
    async fn execute_agent(
        &self,
        invocation: AgentInvocation,
        task_store: Option<Arc<TaskStore>>,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome, ServerError>;
}

/// Build the configured runtime.
pub fn build_runtime(config: &SandboxConfig) -> Result<Arc<dyn SandboxRuntime>, ServerError> {
    match config.runtime {
        SandboxKind::Container => Ok(Arc::new(container::ContainerRuntime::new(config.clone())?)),
        SandboxKind::Process => Ok(Arc::new(process::ProcessRuntime::new(config.clone()))),
    }
}

/// Stage input files into the workspace, refusing unsafe names.
pub(crate) fn stage_workspace_files(
    workspace: &Path,
    files: &[(String, Vec<u8>)],
) -> Result<(), ServerError> {
    for (name, content) in files {
        let target = match path_guard::resolve_inside(workspace, name) {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!(filename = %name, error = %e, "skipping unsafe workspace file");
                continue;
            }
        };
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ServerError::Sandbox(format!("workspace mkdir failed: {e}")))?;
        }
        std::fs::write(&target, content)
            .map_err(|e| ServerError::Sandbox(format!("workspace stage failed for {name}: {e}")))?;
        tracing::debug!(filename = %name, size = content.len(), "staged workspace file");
    }
    Ok(())
}

/// Collect artifacts from the workspace `out/` directory: direct
/// children only for the container runtime, recursive for the process
/// runtime.
pub(crate) fn collect_artifacts(workspace: &Path, recursive: bool) -> Vec<CollectedArtifact> {
    let out_dir = workspace.join(OUT_DIR);
    if !out_dir.is_dir() {
        return Vec::new();
    }

    let mut artifacts = Vec::new();
    let entries: Vec<std::path::PathBuf> = if recursive {
        walkdir::WalkDir::new(&out_dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect()
    } else {
        match std::fs::read_dir(&out_dir) {
            Ok(dir) => dir
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect(),
            Err(_) => Vec::new(),
        }
    };

    for path in entries {
        let Ok(bytes) = std::fs::read(&path) else {
            tracing::warn!(path = %path.display(), "failed to read artifact");
            continue;
        };
        let relative = path
            .strip_prefix(workspace)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| path.to_string_lossy().into_owned());
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        tracing::info!(artifact = %relative, size = bytes.len(), "collected artifact");
        artifacts.push(CollectedArtifact {
            name,
            size: bytes.len(),
            relative_path: relative,
            bytes,
        });
    }

    artifacts.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    artifacts
}

/// Flush accumulated log lines into the task store once the batch is
/// full (or unconditionally when `force` is set).
pub(crate) fn flush_logs(
    task_store: &Option<Arc<TaskStore>>,
    operation_id: &str,
    batch: &mut Vec<String>,
    force: bool,
) {
    if batch.is_empty() || (!force && batch.len() < LOG_BATCH) {
        return;
    }
    if let Some(store) = task_store {
        store.append_logs(operation_id, batch.drain(..));
    } else {
        batch.clear();
    }
}
