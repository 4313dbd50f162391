// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! Agent compute providers.
//!
//! One provider per agent CLI kind. `execute` stages decrypted inputs
//! into a workspace naming scheme, assembles the batch-mode prompt,
//! registers the task, and hands the invocation to the sandbox runtime
//! on a background task that outlives the request. Completion writes
//! artifacts through the artifact store and lands the terminal status
//! in the task store, which `get`/`cancel` read.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::application::artifact_service::ArtifactService;
use crate::application::task_store::{TaskSnapshot, TaskStore};
use crate::config::AgentCredentials;
use crate::domain::error::ServerError;
use crate::domain::grant::{GrantFile, OP_GEMINI_AGENT, OP_QWEN_AGENT};
use crate::domain::operation::{
    ExecuteReceipt, FileContent, OperationContext, OperationStatus, OperationView,
};
use crate::domain::provider::ComputeProvider;
use crate::infrastructure::sandbox::output::SENTINEL;
use crate::infrastructure::sandbox::{
    AgentInvocation, AgentStatus, SandboxRuntime,
};

const STDOUT_EXCERPT_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    Qwen,
    Gemini,
}

impl AgentKind {
    pub fn operation(&self) -> &'static str {
        match self {
            AgentKind::Qwen => OP_QWEN_AGENT,
            AgentKind::Gemini => OP_GEMINI_AGENT,
        }
    }

    /// Operation-id prefix, also used for `get`/`cancel` routing.
    pub fn prefix(&self) -> &'static str {
        match self {
            AgentKind::Qwen => "qwen",
            AgentKind::Gemini => "gemini",
        }
    }

    fn default_cli(&self) -> CliSpec {
        match self {
            // qwen takes the prompt as an argument with auto-approval.
            AgentKind::Qwen => CliSpec {
                command: "qwen".into(),
                prompt_flag: Some("-p".into()),
                fixed_args: vec!["-y".into()],
                prompt_via_stdin: false,
            },
            // gemini reads the prompt from stdin; its built-in sandbox
            // is disabled because ours wraps it already.
            AgentKind::Gemini => CliSpec {
                command: "gemini".into(),
                prompt_flag: None,
                fixed_args: vec!["-y".into(), "--sandbox=false".into()],
                prompt_via_stdin: true,
            },
        }
    }

    fn env_overrides(&self, credentials: &AgentCredentials) -> HashMap<String, String> {
        let mut env = HashMap::new();
        match self {
            AgentKind::Qwen => {
                // The qwen CLI speaks the OpenAI-compatible variables.
                if let (Some(key), Some(url), Some(model)) = (
                    &credentials.qwen_api_key,
                    &credentials.qwen_api_url,
                    &credentials.qwen_model,
                ) {
                    env.insert("OPENAI_API_KEY".into(), key.clone());
                    env.insert("OPENAI_BASE_URL".into(), url.clone());
                    env.insert("OPENAI_MODEL".into(), model.clone());
                }
            }
            AgentKind::Gemini => {
                env.insert("GOOGLE_GENAI_DISABLE_TELEMETRY".into(), "1".into());
                env.insert("GEMINI_USAGE_STATISTICS_ENABLED".into(), "false".into());
                if let Some(key) = &credentials.gemini_api_key {
                    env.insert("GEMINI_API_KEY".into(), key.clone());
                }
            }
        }
        env
    }

    fn api_key<'a>(&self, credentials: &'a AgentCredentials) -> Option<&'a str> {
        match self {
            AgentKind::Qwen => credentials.qwen_api_key.as_deref(),
            AgentKind::Gemini => credentials.gemini_api_key.as_deref(),
        }
    }
}

/// How the agent CLI is launched and how it receives the prompt.
#[derive(Debug, Clone)]
pub struct CliSpec {
    pub command: String,
    pub prompt_flag: Option<String>,
    pub fixed_args: Vec<String>,
    pub prompt_via_stdin: bool,
}

impl CliSpec {
    fn invocation_args(&self, prompt: &str) -> (Vec<String>, Option<String>) {
        if self.prompt_via_stdin {
            return (self.fixed_args.clone(), Some(prompt.to_string()));
        }
        let mut args = Vec::with_capacity(self.fixed_args.len() + 2);
        if let Some(flag) = &self.prompt_flag {
            args.push(flag.clone());
        }
        args.push(prompt.to_string());
        args.extend(self.fixed_args.iter().cloned());
        (args, None)
    }
}

/// Name decrypted inputs for the workspace, keyed off a cheap content
/// sniff so agents see descriptive filenames.
fn workspace_filename(index: usize, content: &str) -> String {
    let lowered = content.to_lowercase();
    if lowered.contains("chatgpt") {
        format!("chatgpt_conversations_{index:02}.txt")
    } else if lowered.contains("spotify") {
        format!("spotify_data_{index:02}.json")
    } else if lowered.contains("linkedin") {
        format!("linkedin_profile_{index:02}.json")
    } else {
        format!("user_data_{index:02}.txt")
    }
}

fn prepare_workspace_files(files: &[FileContent]) -> Vec<(String, Vec<u8>)> {
    files
        .iter()
        .enumerate()
        .map(|(i, file)| {
            (
                workspace_filename(i, &file.content),
                file.content.clone().into_bytes(),
            )
        })
        .collect()
}

/// The batch-mode prompt: available files, the `out/` contract, the
/// single JSON result line, and the sentinel.
fn build_agent_prompt(goal: &str, files: &[(String, Vec<u8>)]) -> String {
    let mut files_info = String::new();
    if !files.is_empty() {
        files_info.push_str("\n\nAVAILABLE DATA FILES:\n");
        for (name, content) in files {
            files_info.push_str(&format!(
                "  - {name} ({:.1}KB)\n",
                content.len() as f64 / 1024.0
            ));
        }
    }

    format!(
        "You are running in a headless, single-shot batch mode. \
         Work only inside the current directory.{files_info}\n\
         IMPORTANT: Read and analyze the available data files to complete your task.\n\
         Generate output files in ./out/ directory.\n\n\
         CONSTRAINTS:\n\
         - No follow-up questions. Assume sensible defaults.\n\
         - Create ./out/ directory if needed.\n\
         - Save work products to ./out/.\n\
         - At completion, print exactly one JSON line describing results:\n  \
         {{\"status\":\"ok|error\",\"summary\":\"<one line>\",\"artifacts\":[\"./out/...\"],\"notes\":\"<optional>\"}}\n\
         - Then print exactly: {SENTINEL}\n\n\
         GOAL:\n{goal}\n"
    )
}

pub struct AgentProvider {
    kind: AgentKind,
    cli: CliSpec,
    runtime: Arc<dyn SandboxRuntime>,
    task_store: Arc<TaskStore>,
    artifacts: Arc<ArtifactService>,
    credentials: AgentCredentials,
}

impl AgentProvider {
    pub fn new(
        kind: AgentKind,
        runtime: Arc<dyn SandboxRuntime>,
        task_store: Arc<TaskStore>,
        artifacts: Arc<ArtifactService>,
        credentials: AgentCredentials,
    ) -> Self {
        Self {
            cli: kind.default_cli(),
            kind,
            runtime,
            task_store,
            artifacts,
            credentials,
        }
    }

    /// Override how the CLI is launched (alternate install paths,
    /// stub binaries in tests).
    pub fn with_cli(mut self, cli: CliSpec) -> Self {
        self.cli = cli;
        self
    }

    fn render_view(operation_id: &str, snapshot: &TaskSnapshot) -> OperationView {
        let result = snapshot.result.clone().unwrap_or_else(|| {
            json!({
                "status": snapshot.status.as_str(),
                "summary": format!("Task is {}", snapshot.status.as_str()),
                "result": {},
                "artifacts": [],
                "logs": snapshot.logs,
            })
        });

        OperationView {
            id: operation_id.to_string(),
            status: snapshot.status,
            started_at: snapshot.started_at,
            finished_at: snapshot.completed_at,
            result: Some(result),
        }
    }

    async fn run_agent(
        runtime: Arc<dyn SandboxRuntime>,
        task_store: Arc<TaskStore>,
        artifacts: Arc<ArtifactService>,
        invocation: AgentInvocation,
        ctx: OperationContext,
        cancel: CancellationToken,
    ) {
        let operation_id = invocation.operation_id.clone();
        task_store.update_status(&operation_id, OperationStatus::Running, None, None);

        let outcome = match runtime
            .execute_agent(invocation, Some(task_store.clone()), cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(%operation_id, error = %e, "sandbox runtime failed");
                task_store.update_status(
                    &operation_id,
                    OperationStatus::Failed,
                    None,
                    Some(e.to_string()),
                );
                return;
            }
        };

        // Failed runs discard whatever the agent wrote; only clean
        // completions persist artifacts.
        let stored = if outcome.status == AgentStatus::Ok && !outcome.artifacts.is_empty() {
            match artifacts.store_artifacts(&ctx, &outcome.artifacts).await {
                Ok(stored) => stored,
                Err(e) => {
                    tracing::error!(%operation_id, error = %e, "artifact storage failed");
                    task_store.update_status(
                        &operation_id,
                        OperationStatus::Failed,
                        None,
                        Some(format!("artifact storage failed: {e}")),
                    );
                    return;
                }
            }
        } else {
            Vec::new()
        };

        let mut excerpt = outcome.stdout_excerpt;
        if excerpt.len() > STDOUT_EXCERPT_LIMIT {
            let mut cut = STDOUT_EXCERPT_LIMIT;
            while cut > 0 && !excerpt.is_char_boundary(cut) {
                cut -= 1;
            }
            excerpt.truncate(cut);
        }

        let result = json!({
            "status": outcome.status.as_str(),
            "summary": outcome.summary,
            "result": outcome.structured_result.clone().unwrap_or_else(|| json!({})),
            "artifacts": stored,
            "logs": outcome.logs,
            "stdout": excerpt,
            "execution_time_ms": outcome.execution_time.as_millis() as u64,
        });

        let (status, error) = match outcome.status {
            AgentStatus::Ok => (OperationStatus::Succeeded, None),
            _ => (OperationStatus::Failed, Some(outcome.summary.clone())),
        };
        task_store.update_status(&operation_id, status, Some(result), error);
        tracing::info!(%operation_id, status = outcome.status.as_str(), "agent task completed");
    }
}

#[async_trait]
impl ComputeProvider for AgentProvider {
    async fn execute(
        &self,
        grant: &GrantFile,
        files: &[FileContent],
        ctx: &OperationContext,
    ) -> Result<ExecuteReceipt, ServerError> {
        let goal = grant.goal().ok_or_else(|| {
            ServerError::Validation(format!(
                "{} operation requires a 'goal' parameter",
                self.kind.operation()
            ))
        })?;

        let operation_id = format!("{}_{}", self.kind.prefix(), Utc::now().timestamp_millis());
        let created_at = Utc::now().to_rfc3339();

        let workspace_files = prepare_workspace_files(files);
        let prompt = build_agent_prompt(goal, &workspace_files);
        let (args, stdin_input) = self.cli.invocation_args(&prompt);

        let invocation = AgentInvocation {
            agent_kind: self.kind.prefix().to_string(),
            command: self.cli.command.clone(),
            args,
            workspace_files,
            env: self.kind.env_overrides(&self.credentials),
            operation_id: operation_id.clone(),
            stdin_input,
            requires_network: true,
            redact_key: self.kind.api_key(&self.credentials).map(String::from),
        };

        self.task_store.create(&operation_id);
        let cancel = CancellationToken::new();
        self.task_store.set_handle(&operation_id, cancel.clone());

        let background_ctx = OperationContext {
            operation_id: operation_id.clone(),
            grantor: ctx.grantor,
            grantee: ctx.grantee,
            permission_id: ctx.permission_id,
        };

        // The agent must outlive this request; only the task record's
        // existence is awaited.
        tokio::spawn(Self::run_agent(
            self.runtime.clone(),
            self.task_store.clone(),
            self.artifacts.clone(),
            invocation,
            background_ctx,
            cancel,
        ));

        tracing::info!(%operation_id, agent = self.kind.prefix(), "agent task dispatched");
        Ok(ExecuteReceipt {
            id: operation_id,
            created_at,
        })
    }

    async fn get(&self, operation_id: &str) -> Result<OperationView, ServerError> {
        let snapshot = self
            .task_store
            .get(operation_id)
            .ok_or_else(|| ServerError::not_found("Operation", operation_id))?;
        Ok(Self::render_view(operation_id, &snapshot))
    }

    async fn cancel(&self, operation_id: &str) -> Result<bool, ServerError> {
        Ok(self.task_store.cancel(operation_id))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    use alloy_primitives::{Address, U256};

    use crate::config::{ArtifactBackend, SandboxConfig};
    use crate::identity::IdentityService;
    use crate::infrastructure::sandbox::process::ProcessRuntime;
    use crate::infrastructure::storage;

    const MNEMONIC: &str = "test test test test test test test test test test test junk";

    fn stub_cli(script: &str) -> CliSpec {
        CliSpec {
            command: "/bin/sh".into(),
            prompt_flag: None,
            fixed_args: vec!["-c".into(), script.into()],
            prompt_via_stdin: true,
        }
    }

    fn grant(goal: Option<&str>) -> GrantFile {
        let mut parameters = serde_json::Map::new();
        if let Some(goal) = goal {
            parameters.insert("goal".into(), json!(goal));
        }
        GrantFile {
            grantee: grantee(),
            operation: OP_QWEN_AGENT.into(),
            parameters: Value::Object(parameters),
            expires: None,
        }
    }

    fn grantor() -> Address {
        "0x1111111111111111111111111111111111111111"
            .parse()
            .unwrap()
    }

    fn grantee() -> Address {
        "0x2222222222222222222222222222222222222222"
            .parse()
            .unwrap()
    }

    fn ctx() -> OperationContext {
        OperationContext {
            operation_id: "pending".into(),
            grantor: grantor(),
            grantee: grantee(),
            permission_id: U256::from(1),
        }
    }

    struct Harness {
        provider: AgentProvider,
        task_store: Arc<TaskStore>,
        artifacts: Arc<ArtifactService>,
        _artifact_dir: tempfile::TempDir,
    }

    fn harness(script: &str) -> Harness {
        let artifact_dir = tempfile::tempdir().unwrap();
        let operator = storage::build_operator(&ArtifactBackend::Local {
            root: artifact_dir.path().to_string_lossy().into_owned(),
        })
        .unwrap();
        let identity = Arc::new(IdentityService::new(MNEMONIC, "english").unwrap());
        let artifacts = Arc::new(ArtifactService::new(
            operator,
            identity,
            Duration::from_secs(3600),
        ));
        let task_store = Arc::new(TaskStore::default());
        let runtime = Arc::new(ProcessRuntime::new(SandboxConfig {
            timeout: Duration::from_secs(20),
            ..SandboxConfig::default()
        }));

        let provider = AgentProvider::new(
            AgentKind::Qwen,
            runtime,
            task_store.clone(),
            artifacts.clone(),
            AgentCredentials {
                qwen_api_key: None,
                qwen_api_url: None,
                qwen_model: None,
                gemini_api_key: None,
            },
        )
        .with_cli(stub_cli(script));

        Harness {
            provider,
            task_store,
            artifacts,
            _artifact_dir: artifact_dir,
        }
    }

    async fn wait_terminal(task_store: &TaskStore, operation_id: &str) -> TaskSnapshot {
        for _ in 0..200 {
            if let Some(snapshot) = task_store.get(operation_id) {
                if snapshot.status.is_terminal() {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("operation {operation_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn successful_agent_stores_artifacts() {
        let script = r#"
            mkdir -p out
            printf 'ok' > out/r.txt
            echo '{"status":"ok","summary":"done","artifacts":["out/r.txt"]}'
            echo '__AGENT_DONE__'
        "#;
        let h = harness(script);

        let receipt = h
            .provider
            .execute(&grant(Some("write a file in out/")), &[], &ctx())
            .await
            .unwrap();
        assert!(receipt.id.starts_with("qwen_"));

        let snapshot = wait_terminal(&h.task_store, &receipt.id).await;
        assert_eq!(snapshot.status, OperationStatus::Succeeded);

        let view = h.provider.get(&receipt.id).await.unwrap();
        let result = view.result.unwrap();
        assert_eq!(result["status"], "ok");
        assert_eq!(result["artifacts"][0]["path"], "out/r.txt");

        let listing = h.artifacts.list(&receipt.id, grantee()).await.unwrap();
        assert_eq!(listing.artifacts.len(), 1);
        assert_eq!(listing.artifacts[0].size, 2);

        let (bytes, content_type) = h
            .artifacts
            .download(&receipt.id, "out/r.txt", grantee())
            .await
            .unwrap();
        assert_eq!(bytes, b"ok");
        assert_eq!(content_type, "text/plain");
    }

    #[tokio::test]
    async fn failed_agent_discards_artifacts() {
        let script = r#"
            mkdir -p out
            printf 'junk' > out/r.txt
            echo '{"status":"error","summary":"could not finish"}'
            echo '__AGENT_DONE__'
        "#;
        let h = harness(script);

        let receipt = h
            .provider
            .execute(&grant(Some("goal")), &[], &ctx())
            .await
            .unwrap();
        let snapshot = wait_terminal(&h.task_store, &receipt.id).await;

        assert_eq!(snapshot.status, OperationStatus::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("could not finish"));
        // Nothing was persisted for the failed run.
        assert!(matches!(
            h.artifacts.list(&receipt.id, grantee()).await,
            Err(ServerError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn missing_goal_is_a_validation_error() {
        let h = harness("true");
        assert!(matches!(
            h.provider.execute(&grant(None), &[], &ctx()).await,
            Err(ServerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn get_before_completion_shows_placeholder() {
        // Agent sleeps long enough for us to observe the running state.
        let script = r#"
            sleep 2
            echo '{"status":"ok","summary":"done"}'
            echo '__AGENT_DONE__'
        "#;
        let h = harness(script);
        let receipt = h
            .provider
            .execute(&grant(Some("goal")), &[], &ctx())
            .await
            .unwrap();

        let view = h.provider.get(&receipt.id).await.unwrap();
        assert!(matches!(
            view.status,
            OperationStatus::Pending | OperationStatus::Running
        ));
        assert!(view.result.is_some());

        wait_terminal(&h.task_store, &receipt.id).await;
    }

    #[tokio::test]
    async fn cancel_stops_a_running_agent() {
        let script = "sleep 30";
        let h = harness(script);
        let receipt = h
            .provider
            .execute(&grant(Some("goal")), &[], &ctx())
            .await
            .unwrap();

        // Let the background task attach and start.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(h.provider.cancel(&receipt.id).await.unwrap());

        let snapshot = wait_terminal(&h.task_store, &receipt.id).await;
        assert_eq!(snapshot.status, OperationStatus::Cancelled);

        // Second cancel reports false against the terminal record.
        assert!(!h.provider.cancel(&receipt.id).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_operation_is_not_found() {
        let h = harness("true");
        assert!(matches!(
            h.provider.get("qwen_0").await,
            Err(ServerError::NotFound { .. })
        ));
    }

    #[test]
    fn workspace_filenames_follow_content() {
        assert_eq!(
            workspace_filename(0, "my ChatGPT export"),
            "chatgpt_conversations_00.txt"
        );
        assert_eq!(workspace_filename(1, "Spotify playlist"), "spotify_data_01.json");
        assert_eq!(
            workspace_filename(2, "LinkedIn profile dump"),
            "linkedin_profile_02.json"
        );
        assert_eq!(workspace_filename(3, "plain notes"), "user_data_03.txt");
    }

    #[test]
    fn prompt_lists_files_and_contract() {
        let files = vec![("user_data_00.txt".to_string(), vec![0u8; 2048])];
        let prompt = build_agent_prompt("summarize everything", &files);

        assert!(prompt.contains("user_data_00.txt (2.0KB)"));
        assert!(prompt.contains("./out/"));
        assert!(prompt.contains(SENTINEL));
        assert!(prompt.contains("GOAL:\nsummarize everything"));
    }

    #[test]
    fn cli_spec_places_prompt() {
        let (args, stdin) = AgentKind::Qwen.default_cli().invocation_args("the prompt");
        assert_eq!(args, vec!["-p", "the prompt", "-y"]);
        assert!(stdin.is_none());

        let (args, stdin) = AgentKind::Gemini.default_cli().invocation_args("the prompt");
        assert_eq!(args, vec!["-y", "--sandbox=false"]);
        assert_eq!(stdin.as_deref(), Some("the prompt"));
    }
}
