// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! Encrypted artifact storage per operation.
//!
//! The write path mints a fresh 256-bit key per operation, encrypts
//! every artifact under it, and persists only the ECIES-sealed form of
//! the key (sealed to the grantee's derived server identity) in the
//! metadata sidecar. The plaintext key exists only inside one call and
//! zeroizes on drop. Reads are gated on the recovered signer being the
//! operation's grantor or grantee and on the artifact TTL.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::Address;
use chrono::{DateTime, Utc};
use opendal::Operator;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::{ecies, payload};
use crate::domain::error::ServerError;
use crate::domain::operation::OperationContext;
use crate::identity::IdentityService;
use crate::infrastructure::sandbox::CollectedArtifact;
use crate::infrastructure::storage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub name: String,
    pub size: usize,
    pub content_type: String,
    pub checksum_sha256: String,
    pub path: String,
}

/// The metadata sidecar persisted at `operations/<id>/metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationArtifacts {
    pub operation_id: String,
    pub grantor_address: String,
    pub grantee_address: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// The per-operation payload key, ECIES-sealed to the grantee's
    /// derived server key. Never stored in plaintext.
    pub encrypted_payload_key: String,
    pub artifacts: Vec<StoredArtifact>,
}

/// MIME type from the filename extension; octet-stream fallback.
pub fn content_type_for(name: &str) -> &'static str {
    match Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("md") => "text/markdown",
        Some("txt") => "text/plain",
        Some("py") => "text/x-python",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("html") => "text/html",
        Some("css") => "text/css",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

pub struct ArtifactService {
    operator: Operator,
    identity: Arc<IdentityService>,
    ttl: Duration,
}

impl ArtifactService {
    pub fn new(operator: Operator, identity: Arc<IdentityService>, ttl: Duration) -> Self {
        Self {
            operator,
            identity,
            ttl,
        }
    }

    fn object_key(operation_id: &str, name: &str) -> String {
        format!("operations/{operation_id}/artifacts/{name}")
    }

    fn metadata_key(operation_id: &str) -> String {
        format!("operations/{operation_id}/metadata.json")
    }

    /// Encrypt and persist an operation's artifacts, returning the
    /// stored metadata entries.
    pub async fn store_artifacts(
        &self,
        ctx: &OperationContext,
        artifacts: &[CollectedArtifact],
    ) -> Result<Vec<StoredArtifact>, ServerError> {
        let key = payload::generate_key();
        let mut stored = Vec::with_capacity(artifacts.len());

        for artifact in artifacts {
            let ciphertext = payload::encrypt(&artifact.bytes, key.as_ref())?;
            let object_key = Self::object_key(&ctx.operation_id, &artifact.name);

            self.operator
                .write(&object_key, ciphertext)
                .await
                .map_err(|e| ServerError::Internal(format!("artifact upload failed: {e}")))?;

            stored.push(StoredArtifact {
                name: artifact.name.clone(),
                size: artifact.size,
                content_type: content_type_for(&artifact.name).to_string(),
                checksum_sha256: hex::encode(Sha256::digest(&artifact.bytes)),
                path: artifact.relative_path.clone(),
            });
            tracing::info!(
                operation_id = %ctx.operation_id,
                artifact = %artifact.name,
                size = artifact.size,
                "stored encrypted artifact"
            );
        }

        // Seal the payload key to the grantee's derived server identity;
        // only its sealed form leaves this function.
        let grantee_identity = self.identity.derive(ctx.grantee)?;
        let grantee_pk = k256::PublicKey::from_sec1_bytes(&grantee_identity.public_key)
            .map_err(|e| ServerError::Internal(format!("derived key invalid: {e}")))?;
        let encrypted_payload_key = ecies::seal(key.as_ref(), &grantee_pk)?;

        let now = Utc::now();
        let metadata = OperationArtifacts {
            operation_id: ctx.operation_id.clone(),
            grantor_address: ctx.grantor.to_string(),
            grantee_address: ctx.grantee.to_string(),
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.ttl)
                    .unwrap_or_else(|_| chrono::Duration::days(7)),
            encrypted_payload_key,
            artifacts: stored.clone(),
        };

        let body = serde_json::to_vec(&metadata)
            .map_err(|e| ServerError::Internal(format!("metadata encode failed: {e}")))?;
        self.operator
            .write(&Self::metadata_key(&ctx.operation_id), body)
            .await
            .map_err(|e| ServerError::Internal(format!("metadata upload failed: {e}")))?;

        Ok(stored)
    }

    /// Load the metadata sidecar; unknown operations are not-found.
    pub async fn metadata(&self, operation_id: &str) -> Result<OperationArtifacts, ServerError> {
        let raw = self
            .operator
            .read(&Self::metadata_key(operation_id))
            .await
            .map_err(|e| {
                if storage::is_not_found(&e) {
                    ServerError::not_found("Operation", operation_id)
                } else {
                    ServerError::Internal(format!("metadata read failed: {e}"))
                }
            })?;

        serde_json::from_slice(&raw.to_vec())
            .map_err(|e| ServerError::Internal(format!("metadata decode failed: {e}")))
    }

    fn authorize(metadata: &OperationArtifacts, requester: Address) -> Result<(), ServerError> {
        let grantor: Option<Address> = metadata.grantor_address.parse().ok();
        let grantee: Option<Address> = metadata.grantee_address.parse().ok();

        if grantor == Some(requester) || grantee == Some(requester) {
            Ok(())
        } else {
            tracing::warn!(
                operation_id = %metadata.operation_id,
                %requester,
                "artifact access denied"
            );
            Err(ServerError::Authorization(
                "requester is not the operation's grantor or grantee".into(),
            ))
        }
    }

    /// List an operation's artifacts after verifying the requester.
    pub async fn list(
        &self,
        operation_id: &str,
        requester: Address,
    ) -> Result<OperationArtifacts, ServerError> {
        let metadata = self.metadata(operation_id).await?;
        Self::authorize(&metadata, requester)?;
        Ok(metadata)
    }

    /// Download and decrypt one artifact for an authorized requester.
    pub async fn download(
        &self,
        operation_id: &str,
        artifact_path: &str,
        requester: Address,
    ) -> Result<(Vec<u8>, &'static str), ServerError> {
        let metadata = self.metadata(operation_id).await?;
        Self::authorize(&metadata, requester)?;

        if Utc::now() > metadata.expires_at {
            return Err(ServerError::Authorization("artifacts have expired".into()));
        }

        let entry = metadata
            .artifacts
            .iter()
            .find(|a| a.path == artifact_path || a.name == artifact_path)
            .ok_or_else(|| ServerError::not_found("Artifact", artifact_path))?;

        let grantee: Address = metadata
            .grantee_address
            .parse()
            .map_err(|_| ServerError::Internal("metadata grantee address invalid".into()))?;
        let grantee_identity = self.identity.derive(grantee)?;
        let key = ecies::unseal(&metadata.encrypted_payload_key, &grantee_identity.secret)?;

        let ciphertext = self
            .operator
            .read(&Self::object_key(operation_id, &entry.name))
            .await
            .map_err(|e| {
                if storage::is_not_found(&e) {
                    ServerError::not_found("Artifact", artifact_path)
                } else {
                    ServerError::Internal(format!("artifact read failed: {e}"))
                }
            })?;

        let plaintext = payload::decrypt(&ciphertext.to_vec(), key.as_slice())?;
        Ok((plaintext, content_type_for(&entry.name)))
    }
}
