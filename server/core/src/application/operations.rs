// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! End-to-end operation orchestration.
//!
//! `create` drives the whole pipeline: parse and validate the request,
//! recover the signer, resolve the permission and grantee on-chain,
//! fetch and validate the grant, derive the grantor's server identity,
//! fetch and decrypt every permitted file, and dispatch to the compute
//! provider. Grant validation strictly precedes any decryption, and any
//! single failure aborts the call before a task record exists.

use std::sync::Arc;

use alloy_primitives::{Address, Signature, U256};
use chrono::Utc;
use serde_json::Value;

use crate::application::registry::ProviderRegistry;
use crate::domain::chain::ChainGateway;
use crate::domain::error::ServerError;
use crate::domain::grant::{self, OP_LLM_INFERENCE};
use crate::domain::operation::{ExecuteReceipt, FileContent, OperationContext, OperationView};
use crate::crypto::{ecies, payload};
use crate::identity::IdentityService;
use crate::infrastructure::fetch::ContentFetcher;

/// Address reported by the mock-mode signature bypass.
const MOCK_SIGNER: &str = "0x742d35Cc6634C0532925a3b8D4C9db96C4b4d8b6";

pub struct OperationsService {
    chain: Arc<dyn ChainGateway>,
    fetcher: Arc<ContentFetcher>,
    identity: Arc<IdentityService>,
    registry: Arc<ProviderRegistry>,
    max_file_bytes: usize,
    mock_mode: bool,
}

impl OperationsService {
    pub fn new(
        chain: Arc<dyn ChainGateway>,
        fetcher: Arc<ContentFetcher>,
        identity: Arc<IdentityService>,
        registry: Arc<ProviderRegistry>,
        max_file_bytes: usize,
        mock_mode: bool,
    ) -> Self {
        if mock_mode {
            tracing::warn!("MOCK MODE is enabled: signature verification is bypassed");
        }
        Self {
            chain,
            fetcher,
            identity,
            registry,
            max_file_bytes,
            mock_mode,
        }
    }

    /// Recover the signer of a personal-message signature over the raw
    /// request string.
    fn recover_signer(&self, request_json: &str, signature: &str) -> Result<Address, ServerError> {
        if self.mock_mode {
            tracing::warn!("mock mode: returning fixed signer address");
            return Ok(MOCK_SIGNER.parse().expect("static address"));
        }

        let signature: Signature = signature
            .parse()
            .map_err(|_| ServerError::Authentication("malformed signature".into()))?;

        signature
            .recover_address_from_msg(request_json.as_bytes())
            .map_err(|_| {
                ServerError::Authentication(
                    "invalid signature or unable to recover signer address".into(),
                )
            })
    }

    fn parse_permission_id(request_json: &str) -> Result<U256, ServerError> {
        let request: Value = serde_json::from_str(request_json).map_err(|_| {
            ServerError::Validation("operation request is not valid JSON".into())
        })?;

        let permission_id = request
            .get("permission_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                ServerError::Validation("permission_id must be an integer".into())
            })?;

        if permission_id <= 0 {
            return Err(ServerError::Validation(
                "permission_id must be positive".into(),
            ));
        }
        Ok(U256::from(permission_id as u64))
    }

    pub async fn create(
        &self,
        request_json: &str,
        signature: &str,
    ) -> Result<ExecuteReceipt, ServerError> {
        let permission_id = Self::parse_permission_id(request_json)?;
        let signer = self.recover_signer(request_json, signature)?;
        tracing::info!(%permission_id, %signer, "operation create requested");

        let permission = self.chain.fetch_permission(permission_id).await?;
        if permission.file_ids.is_empty() {
            return Err(ServerError::Validation(
                "permission grants access to no files".into(),
            ));
        }

        let grantee = self.chain.fetch_grantee(permission.grantee_id).await?;
        if signer != grantee.grantee_address {
            return Err(ServerError::Authentication(format!(
                "signer {signer} does not match on-chain grantee {}",
                grantee.grantee_address
            )));
        }

        let grant_bytes = self
            .fetcher
            .fetch(&permission.grant, self.max_file_bytes)
            .await?;
        let raw_grant: Value = serde_json::from_slice(&grant_bytes)
            .map_err(|e| ServerError::GrantValidation(format!("grant file is not JSON: {e}")))?;
        let grant = grant::validate(&raw_grant, grantee.grantee_address, Utc::now().timestamp())?;
        grant::validate_response_format(&grant)?;
        tracing::info!(operation = %grant.operation, "grant validated");

        // Identity derivation and decryption only happen after the
        // grant has been accepted.
        let server_identity = self.identity.derive(permission.grantor)?;

        let mut files = Vec::with_capacity(permission.file_ids.len());
        for file_id in &permission.file_ids {
            let record = self.chain.fetch_file(*file_id).await?;
            let sealed_key = self
                .chain
                .fetch_file_key(*file_id, server_identity.address)
                .await?;
            let encrypted = self
                .fetcher
                .fetch(&record.storage_url, self.max_file_bytes)
                .await?;

            let file_key = ecies::unseal(sealed_key.as_str(), &server_identity.secret)?;
            let decrypted = payload::decrypt(&encrypted, file_key.as_slice())?;
            let content = String::from_utf8(decrypted).map_err(|_| ServerError::Decryption)?;

            tracing::debug!(%file_id, size = content.len(), "file decrypted");
            files.push(FileContent {
                file_id: *file_id,
                content,
            });
        }

        let provider = self.registry.get(&grant.operation).ok_or_else(|| {
            ServerError::Internal(format!(
                "no provider registered for operation {}",
                grant.operation
            ))
        })?;

        let ctx = OperationContext {
            operation_id: format!("{}_{}", grant.operation, Utc::now().timestamp_millis()),
            grantor: permission.grantor,
            grantee: signer,
            permission_id,
        };

        let receipt = provider.execute(&grant, &files, &ctx).await?;
        tracing::info!(operation_id = %receipt.id, "operation dispatched");
        Ok(receipt)
    }

    fn route(&self, operation_id: &str) -> Result<Arc<dyn crate::domain::provider::ComputeProvider>, ServerError> {
        // Agent-born ids carry a registered prefix; everything else
        // belongs to the default remote-LLM provider.
        if let Some(provider) = self.registry.provider_for_id(operation_id) {
            return Ok(provider);
        }
        self.registry
            .get(OP_LLM_INFERENCE)
            .ok_or_else(|| ServerError::Internal("default provider not registered".into()))
    }

    pub async fn get(&self, operation_id: &str) -> Result<OperationView, ServerError> {
        self.route(operation_id)?.get(operation_id).await
    }

    pub async fn cancel(&self, operation_id: &str) -> Result<bool, ServerError> {
        self.route(operation_id)?.cancel(operation_id).await
    }

    /// Re-exported for the artifacts API: recover a signer over an
    /// exact signed payload string.
    pub fn verify_signed_payload(
        &self,
        payload: &str,
        signature: &str,
    ) -> Result<Address, ServerError> {
        self.recover_signer(payload, signature)
    }
}
