// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! Remote LLM inference via the Replicate predictions API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::LlmConfig;
use crate::domain::error::ServerError;
use crate::domain::grant::GrantFile;
use crate::domain::operation::{
    ExecuteReceipt, FileContent, OperationContext, OperationStatus, OperationView,
};
use crate::domain::provider::ComputeProvider;
use crate::infrastructure::llm::json_mode;

const DEFAULT_BASE_URL: &str = "https://api.replicate.com/v1";
const TRUNCATION_NOTICE: &str = "\n[data truncated to fit prompt size limit]\n";

fn prompt_data_separator() -> String {
    format!("{}\n", "-----".repeat(80))
}

#[derive(Serialize)]
struct PredictionRequest {
    model: String,
    input: PredictionInput,
}

#[derive(Serialize)]
struct PredictionInput {
    prompt: String,
}

#[derive(Deserialize)]
struct PredictionResponse {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    completed_at: Option<String>,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

impl PredictionResponse {
    fn mapped_status(&self) -> OperationStatus {
        match self.status.as_str() {
            "starting" | "processing" => OperationStatus::Running,
            "succeeded" => OperationStatus::Succeeded,
            "canceled" => OperationStatus::Cancelled,
            "failed" => OperationStatus::Failed,
            // Freshly created predictions report no status yet.
            _ => OperationStatus::Pending,
        }
    }

    /// Replicate streams text output as a list of chunks; join them.
    fn output_text(&self) -> Option<String> {
        match &self.output {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Array(parts)) => Some(
                parts
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .concat(),
            ),
            Some(other) => Some(other.to_string()),
            None => None,
        }
    }
}

fn parse_timestamp(raw: &Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

pub struct ReplicateProvider {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
    model: String,
    max_prompt_bytes: usize,
    /// Prediction ids whose grant requested `json_object` output; the
    /// entry is removed on any terminal state.
    json_predictions: DashMap<String, ()>,
}

impl ReplicateProvider {
    pub fn new(config: &LlmConfig) -> Self {
        Self::with_base_url(config, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(config: &LlmConfig, base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            model: config.model.clone(),
            max_prompt_bytes: config.max_prompt_bytes,
            json_predictions: DashMap::new(),
        }
    }

    fn wants_json(grant: &GrantFile) -> bool {
        grant
            .response_format()
            .and_then(|f| f.get("type"))
            .and_then(Value::as_str)
            == Some("json_object")
    }

    /// Substitute `{{data}}` in the prompt template, truncating the data
    /// block to stay within the prompt size cap and annotating the
    /// prompt when truncation happened.
    fn build_prompt(&self, grant: &GrantFile, files: &[FileContent]) -> String {
        let template = grant.prompt_template().unwrap_or_default();
        let separator = prompt_data_separator();

        let joined = files
            .iter()
            .map(|f| f.content.as_str())
            .collect::<Vec<_>>()
            .join(&separator);
        let mut data = format!("\n{joined}\n{separator}");

        let available = self
            .max_prompt_bytes
            .saturating_sub(template.len() + TRUNCATION_NOTICE.len());
        if data.len() > available {
            let mut cut = available;
            while cut > 0 && !data.is_char_boundary(cut) {
                cut -= 1;
            }
            data.truncate(cut);
            data.push_str(TRUNCATION_NOTICE);
            tracing::warn!(
                available,
                "prompt data truncated to fit the configured prompt size"
            );
        }

        template.replace("{{data}}", &data)
    }

    async fn submit(&self, prompt: String) -> Result<PredictionResponse, ServerError> {
        let request = PredictionRequest {
            model: self.model.clone(),
            input: PredictionInput { prompt },
        };

        let response = self
            .client
            .post(format!("{}/predictions", self.base_url))
            .header("Authorization", format!("Token {}", self.api_token))
            .json(&request)
            .send()
            .await
            .map_err(|e| ServerError::Compute(format!("prediction submit failed: {e}")))?;

        Self::decode(response, "prediction submit").await
    }

    async fn poll(&self, prediction_id: &str) -> Result<PredictionResponse, ServerError> {
        let response = self
            .client
            .get(format!("{}/predictions/{prediction_id}", self.base_url))
            .header("Authorization", format!("Token {}", self.api_token))
            .send()
            .await
            .map_err(|e| ServerError::Compute(format!("prediction poll failed: {e}")))?;

        if response.status().as_u16() == 404 {
            return Err(ServerError::not_found("Operation", prediction_id));
        }
        Self::decode(response, "prediction poll").await
    }

    async fn decode(
        response: reqwest::Response,
        context: &str,
    ) -> Result<PredictionResponse, ServerError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServerError::Compute(format!(
                "{context} returned HTTP {status}: {body}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ServerError::Compute(format!("{context} returned malformed JSON: {e}")))
    }

    /// Render the prediction output for the client, applying JSON
    /// extraction when the grant asked for it.
    fn render_result(&self, prediction: &PredictionResponse, wants_json: bool) -> Option<Value> {
        let text = prediction.output_text()?;
        if !wants_json {
            return Some(Value::String(text));
        }

        match json_mode::extract_json(&text, true) {
            Ok(object) => Some(object),
            Err(error) => Some(json!({
                "error": "json_parse_failed",
                "error_message": error,
                "raw_response": text,
            })),
        }
    }
}

#[async_trait]
impl ComputeProvider for ReplicateProvider {
    async fn execute(
        &self,
        grant: &GrantFile,
        files: &[FileContent],
        _ctx: &OperationContext,
    ) -> Result<ExecuteReceipt, ServerError> {
        let mut prompt = self.build_prompt(grant, files);

        let wants_json = Self::wants_json(grant);
        if wants_json {
            prompt = json_mode::enforce_json_prompt(&prompt);
        }

        let prediction = self.submit(prompt).await?;
        tracing::info!(prediction_id = %prediction.id, model = %self.model, "prediction submitted");

        if wants_json {
            self.json_predictions.insert(prediction.id.clone(), ());
        }

        Ok(ExecuteReceipt {
            created_at: prediction
                .created_at
                .clone()
                .unwrap_or_else(|| Utc::now().to_rfc3339()),
            id: prediction.id,
        })
    }

    async fn get(&self, operation_id: &str) -> Result<OperationView, ServerError> {
        let prediction = self.poll(operation_id).await?;
        let status = prediction.mapped_status();

        let wants_json = self.json_predictions.contains_key(operation_id);
        let result = match status {
            OperationStatus::Succeeded => self.render_result(&prediction, wants_json),
            OperationStatus::Failed => prediction
                .error
                .as_ref()
                .map(|e| Value::String(e.to_string())),
            _ => None,
        };

        if status.is_terminal() {
            self.json_predictions.remove(operation_id);
        }

        Ok(OperationView {
            id: prediction.id,
            status,
            started_at: parse_timestamp(&prediction.started_at),
            finished_at: parse_timestamp(&prediction.completed_at),
            result,
        })
    }

    async fn cancel(&self, operation_id: &str) -> Result<bool, ServerError> {
        let response = self
            .client
            .post(format!(
                "{}/predictions/{operation_id}/cancel",
                self.base_url
            ))
            .header("Authorization", format!("Token {}", self.api_token))
            .send()
            .await
            .map_err(|e| ServerError::Compute(format!("prediction cancel failed: {e}")))?;

        if !response.status().is_success() {
            return Ok(false);
        }

        let prediction: PredictionResponse = match response.json().await {
            Ok(p) => p,
            Err(_) => return Ok(false),
        };
        self.json_predictions.remove(operation_id);
        Ok(prediction.status == "canceled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, U256};

    fn config(max_prompt_bytes: usize) -> LlmConfig {
        LlmConfig {
            api_token: "test-token".into(),
            model: "deepseek-ai/deepseek-v3".into(),
            max_prompt_bytes,
        }
    }

    fn grant(params: Value) -> GrantFile {
        GrantFile {
            grantee: Address::ZERO,
            operation: "llm_inference".into(),
            parameters: params,
            expires: None,
        }
    }

    fn ctx() -> OperationContext {
        OperationContext {
            operation_id: "op".into(),
            grantor: Address::ZERO,
            grantee: Address::ZERO,
            permission_id: U256::from(1),
        }
    }

    fn files(contents: &[&str]) -> Vec<FileContent> {
        contents
            .iter()
            .enumerate()
            .map(|(i, c)| FileContent {
                file_id: U256::from(i as u64),
                content: c.to_string(),
            })
            .collect()
    }

    #[test]
    fn prompt_substitutes_data_with_separator() {
        let provider = ReplicateProvider::new(&config(1_000_000));
        let prompt = provider.build_prompt(
            &grant(json!({"prompt": "Summarize {{data}}"})),
            &files(&["hello world"]),
        );

        let separator = prompt_data_separator();
        assert_eq!(prompt, format!("Summarize \nhello world\n{separator}"));
    }

    #[test]
    fn prompt_joins_multiple_files() {
        let provider = ReplicateProvider::new(&config(1_000_000));
        let prompt =
            provider.build_prompt(&grant(json!({"prompt": "{{data}}"})), &files(&["a", "b"]));

        let separator = prompt_data_separator();
        assert_eq!(prompt, format!("\na{separator}b\n{separator}"));
    }

    #[test]
    fn oversized_data_is_truncated_with_notice() {
        let provider = ReplicateProvider::new(&config(600));
        let big = "x".repeat(5_000);
        let prompt = provider.build_prompt(&grant(json!({"prompt": "Go: {{data}}"})), &files(&[&big]));

        assert!(prompt.len() <= 600 + "Go: ".len());
        assert!(prompt.contains("[data truncated"));
    }

    #[tokio::test]
    async fn execute_submits_and_reports_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/predictions")
            .match_header("authorization", "Token test-token")
            .with_body(
                json!({"id": "pred-1", "status": "starting", "created_at": "2026-01-01T00:00:00Z"})
                    .to_string(),
            )
            .create_async()
            .await;

        let provider = ReplicateProvider::with_base_url(&config(10_000), &server.url());
        let receipt = provider
            .execute(
                &grant(json!({"prompt": "Summarize {{data}}"})),
                &files(&["data"]),
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(receipt.id, "pred-1");
        assert_eq!(receipt.created_at, "2026-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn get_maps_remote_states() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/predictions/pred-2")
            .with_body(
                json!({
                    "id": "pred-2",
                    "status": "succeeded",
                    "started_at": "2026-01-01T00:00:01Z",
                    "completed_at": "2026-01-01T00:00:05Z",
                    "output": ["Hello", " there"]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let provider = ReplicateProvider::with_base_url(&config(10_000), &server.url());
        let view = provider.get("pred-2").await.unwrap();

        assert_eq!(view.status, OperationStatus::Succeeded);
        assert_eq!(view.result.unwrap(), Value::String("Hello there".into()));
        assert!(view.started_at.is_some());
        assert!(view.finished_at.is_some());
    }

    #[tokio::test]
    async fn json_mode_extracts_object_and_wraps_failures() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/predictions")
            .with_body(json!({"id": "pred-3", "status": "starting"}).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/predictions/pred-3")
            .with_body(
                json!({
                    "id": "pred-3",
                    "status": "succeeded",
                    "output": "```json\n{\"score\": 7}\n```"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let provider = ReplicateProvider::with_base_url(&config(10_000), &server.url());
        provider
            .execute(
                &grant(json!({
                    "prompt": "{{data}}",
                    "response_format": {"type": "json_object"}
                })),
                &files(&["data"]),
                &ctx(),
            )
            .await
            .unwrap();

        let view = provider.get("pred-3").await.unwrap();
        assert_eq!(view.result.unwrap(), json!({"score": 7}));
        // Terminal state dropped the format record.
        assert!(provider.json_predictions.is_empty());
    }

    #[tokio::test]
    async fn json_mode_failure_is_wrapped() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/predictions")
            .with_body(json!({"id": "pred-4", "status": "starting"}).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/predictions/pred-4")
            .with_body(
                json!({"id": "pred-4", "status": "succeeded", "output": "no json at all"})
                    .to_string(),
            )
            .create_async()
            .await;

        let provider = ReplicateProvider::with_base_url(&config(10_000), &server.url());
        provider
            .execute(
                &grant(json!({
                    "prompt": "{{data}}",
                    "response_format": {"type": "json_object"}
                })),
                &files(&["data"]),
                &ctx(),
            )
            .await
            .unwrap();

        let result = provider.get("pred-4").await.unwrap().result.unwrap();
        assert_eq!(result["error"], "json_parse_failed");
        assert_eq!(result["raw_response"], "no json at all");
    }

    #[tokio::test]
    async fn cancel_reports_remote_acceptance() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/predictions/pred-5/cancel")
            .with_body(json!({"id": "pred-5", "status": "canceled"}).to_string())
            .create_async()
            .await;

        let provider = ReplicateProvider::with_base_url(&config(10_000), &server.url());
        assert!(provider.cancel("pred-5").await.unwrap());
    }

    #[tokio::test]
    async fn unknown_prediction_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/predictions/nope")
            .with_status(404)
            .create_async()
            .await;

        let provider = ReplicateProvider::with_base_url(&config(10_000), &server.url());
        assert!(matches!(
            provider.get("nope").await,
            Err(ServerError::NotFound { .. })
        ));
    }
}
