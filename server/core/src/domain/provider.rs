// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

// Compute provider domain interface.
//
// The two provider families (remote LLM inference, sandboxed agents)
// share exactly these three methods; anything richer lives behind the
// implementations. Infrastructure adapters implement this trait, the
// orchestrator only ever sees the trait object.

use async_trait::async_trait;

use crate::domain::error::ServerError;
use crate::domain::grant::GrantFile;
use crate::domain::operation::{ExecuteReceipt, FileContent, OperationContext, OperationView};

#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Dispatch the operation. For agent providers this returns as soon
    /// as the background task exists; for remote providers as soon as
    /// the remote accepted the submission.
    async fn execute(
        &self,
        grant: &GrantFile,
        files: &[FileContent],
        ctx: &OperationContext,
    ) -> Result<ExecuteReceipt, ServerError>;

    /// Current state of a previously dispatched operation.
    async fn get(&self, operation_id: &str) -> Result<OperationView, ServerError>;

    /// Best-effort cancellation; `Ok(false)` when the operation is
    /// already terminal or cancellation was not accepted.
    async fn cancel(&self, operation_id: &str) -> Result<bool, ServerError>;
}
