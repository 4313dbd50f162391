// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! Artifact object storage backends.
//!
//! One factory returns an [`opendal::Operator`] for whichever backend
//! the deployment configured: an S3-compatible bucket in production or
//! a local directory when no remote store is available.

use opendal::Operator;

use crate::config::ArtifactBackend;
use crate::domain::error::ServerError;

pub fn build_operator(backend: &ArtifactBackend) -> Result<Operator, ServerError> {
    let operator = match backend {
        ArtifactBackend::S3 {
            bucket,
            endpoint,
            access_key_id,
            secret_access_key,
        } => {
            let builder = opendal::services::S3::default()
                .bucket(bucket)
                .endpoint(endpoint)
                .access_key_id(access_key_id)
                .secret_access_key(secret_access_key)
                .region("auto");
            Operator::new(builder)
                .map_err(|e| ServerError::Internal(format!("object store init failed: {e}")))?
                .finish()
        }
        ArtifactBackend::Local { root } => {
            std::fs::create_dir_all(root)
                .map_err(|e| ServerError::Internal(format!("artifact dir create failed: {e}")))?;
            let builder = opendal::services::Fs::default().root(root);
            Operator::new(builder)
                .map_err(|e| ServerError::Internal(format!("object store init failed: {e}")))?
                .finish()
        }
    };
    Ok(operator)
}

/// True when the underlying error is a missing object rather than a
/// transport failure.
pub fn is_not_found(err: &opendal::Error) -> bool {
    err.kind() == opendal::ErrorKind::NotFound
}
