// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

// Read-only view of the three on-chain registries. The EVM adapter in
// the infrastructure layer is the production implementation; tests
// substitute an in-memory one.

use alloy_primitives::{Address, U256};
use async_trait::async_trait;

use crate::domain::error::ServerError;
use crate::domain::permission::{EncryptedKeyHex, FileRecord, GranteeRecord, Permission};

#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Permission record by id. Unknown ids are a not-found error,
    /// distinct from transport failures.
    async fn fetch_permission(&self, id: U256) -> Result<Permission, ServerError>;

    async fn fetch_grantee(&self, id: U256) -> Result<GranteeRecord, ServerError>;

    async fn fetch_file(&self, id: U256) -> Result<FileRecord, ServerError>;

    /// The payload key for `file_id`, sealed to `server_address`.
    async fn fetch_file_key(
        &self,
        file_id: U256,
        server_address: Address,
    ) -> Result<EncryptedKeyHex, ServerError>;
}
