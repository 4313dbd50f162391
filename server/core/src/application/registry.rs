// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! Compute provider registry.
//!
//! Maps a grant's operation name onto the provider instance that
//! executes it, plus an operation-id prefix table so `get`/`cancel` on
//! agent-born ids (`qwen_1712…`) route back to the provider that owns
//! them. Providers are registered once at startup; agent providers are
//! shared instances so dispatch and later lookups observe the same
//! state.

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::provider::ComputeProvider;

#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ComputeProvider>>,
    /// op-id prefix (e.g. "qwen") → operation name.
    prefixes: HashMap<String, String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider for an operation name.
    pub fn register(&mut self, operation: &str, provider: Arc<dyn ComputeProvider>) {
        tracing::debug!(%operation, "registered compute provider");
        self.providers.insert(operation.to_string(), provider);
    }

    /// Register a provider whose operation ids carry `prefix_`.
    pub fn register_with_prefix(
        &mut self,
        operation: &str,
        prefix: &str,
        provider: Arc<dyn ComputeProvider>,
    ) {
        self.prefixes
            .insert(prefix.to_string(), operation.to_string());
        self.register(operation, provider);
    }

    pub fn get(&self, operation: &str) -> Option<Arc<dyn ComputeProvider>> {
        self.providers.get(operation).cloned()
    }

    pub fn has(&self, operation: &str) -> bool {
        self.providers.contains_key(operation)
    }

    pub fn operations(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    /// Resolve an operation id back to the provider that minted it, by
    /// its `<prefix>_<timestamp>` convention. `None` for ids without a
    /// registered prefix (callers then use the default provider).
    pub fn provider_for_id(&self, operation_id: &str) -> Option<Arc<dyn ComputeProvider>> {
        let (prefix, _) = operation_id.split_once('_')?;
        let operation = self.prefixes.get(prefix)?;
        self.get(operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::domain::error::ServerError;
    use crate::domain::grant::GrantFile;
    use crate::domain::operation::{
        ExecuteReceipt, FileContent, OperationContext, OperationStatus, OperationView,
    };

    struct StubProvider(&'static str);

    #[async_trait]
    impl ComputeProvider for StubProvider {
        async fn execute(
            &self,
            _grant: &GrantFile,
            _files: &[FileContent],
            _ctx: &OperationContext,
        ) -> Result<ExecuteReceipt, ServerError> {
            Ok(ExecuteReceipt {
                id: format!("{}_1", self.0),
                created_at: "now".into(),
            })
        }

        async fn get(&self, operation_id: &str) -> Result<OperationView, ServerError> {
            Ok(OperationView {
                id: operation_id.to_string(),
                status: OperationStatus::Pending,
                started_at: None,
                finished_at: None,
                result: Some(serde_json::json!(self.0)),
            })
        }

        async fn cancel(&self, _operation_id: &str) -> Result<bool, ServerError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn lookup_by_operation_and_prefix() {
        let mut registry = ProviderRegistry::new();
        registry.register("llm_inference", Arc::new(StubProvider("llm")));
        registry.register_with_prefix("prompt_qwen_agent", "qwen", Arc::new(StubProvider("qwen")));

        assert!(registry.has("llm_inference"));
        assert!(registry.get("unknown_op").is_none());

        let by_prefix = registry.provider_for_id("qwen_1712000000000").unwrap();
        let view = by_prefix.get("qwen_1712000000000").await.unwrap();
        assert_eq!(view.result.unwrap(), serde_json::json!("qwen"));

        // Ids without a registered prefix resolve to nothing.
        assert!(registry.provider_for_id("replicate-id").is_none());
        assert!(registry.provider_for_id("other_123").is_none());
    }
}
