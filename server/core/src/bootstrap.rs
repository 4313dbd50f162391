// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! Service graph assembly.
//!
//! Builds every component from a [`ServerConfig`] and wires them into
//! the HTTP application state. Construction is explicit so tests can
//! assemble the same graph around in-memory substitutes.

use std::sync::Arc;

use crate::application::artifact_service::ArtifactService;
use crate::application::operations::OperationsService;
use crate::application::registry::ProviderRegistry;
use crate::application::task_store::TaskStore;
use crate::config::ServerConfig;
use crate::domain::error::ServerError;
use crate::domain::grant::OP_LLM_INFERENCE;
use crate::identity::IdentityService;
use crate::infrastructure::agents::{AgentKind, AgentProvider};
use crate::infrastructure::chain::EvmChainGateway;
use crate::infrastructure::fetch::ContentFetcher;
use crate::infrastructure::llm::replicate::ReplicateProvider;
use crate::infrastructure::sandbox;
use crate::infrastructure::storage;
use crate::presentation::api::AppState;

pub fn build_state(config: &ServerConfig) -> Result<Arc<AppState>, ServerError> {
    let identity = Arc::new(IdentityService::new(
        config.wallet_mnemonic.clone(),
        &config.mnemonic_language,
    )?);
    let chain = Arc::new(EvmChainGateway::new(&config.chain)?);
    let fetcher = Arc::new(ContentFetcher::new(config.fetch.clone()));
    let task_store = Arc::new(TaskStore::default());

    let operator = storage::build_operator(&config.artifacts.backend)?;
    let artifacts = Arc::new(ArtifactService::new(
        operator,
        identity.clone(),
        config.artifacts.ttl,
    ));

    let runtime = sandbox::build_runtime(&config.sandbox)?;

    let mut registry = ProviderRegistry::new();
    registry.register(
        OP_LLM_INFERENCE,
        Arc::new(ReplicateProvider::new(&config.llm)),
    );
    for kind in [AgentKind::Qwen, AgentKind::Gemini] {
        registry.register_with_prefix(
            kind.operation(),
            kind.prefix(),
            Arc::new(AgentProvider::new(
                kind,
                runtime.clone(),
                task_store.clone(),
                artifacts.clone(),
                config.agents.clone(),
            )),
        );
    }

    let operations = Arc::new(OperationsService::new(
        chain,
        fetcher,
        identity.clone(),
        Arc::new(registry),
        config.fetch.max_file_bytes,
        config.mock_mode,
    ));

    // Janitor: drop terminal task records past the configured TTL.
    let cleanup_ttl = config.task_cleanup_ttl;
    let janitor_store = task_store.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_ttl.min(std::time::Duration::from_secs(300)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            janitor_store.cleanup(cleanup_ttl);
        }
    });

    Ok(Arc::new(AppState {
        operations,
        artifacts,
        identity,
    }))
}
