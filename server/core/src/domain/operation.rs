// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! Operation lifecycle types shared by the orchestrator, the task store
//! and the compute providers.

use alloy_primitives::U256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of an operation. Transitions are strictly
/// PENDING → RUNNING → one of the terminal states; the task store
/// enforces the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Succeeded | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        }
    }
}

/// Identity context threaded from the orchestrator into providers and
/// the artifact store.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub operation_id: String,
    /// User who owns the data.
    pub grantor: alloy_primitives::Address,
    /// Application operating under the permission.
    pub grantee: alloy_primitives::Address,
    pub permission_id: U256,
}

/// A decrypted input file handed to a provider, in permission order.
#[derive(Debug, Clone)]
pub struct FileContent {
    pub file_id: U256,
    pub content: String,
}

/// Returned by `ComputeProvider::execute`: the operation was accepted
/// and is now identified by `id`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteReceipt {
    pub id: String,
    pub created_at: String,
}

/// Client-visible view of an operation, rendered by `get`.
#[derive(Debug, Clone, Serialize)]
pub struct OperationView {
    pub id: String,
    pub status: OperationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Either a structured object (JSON mode) or a string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}
