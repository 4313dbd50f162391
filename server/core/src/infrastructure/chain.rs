// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! EVM adapter for the on-chain registries.
//!
//! All calls are `eth_call` view reads against the configured endpoint.
//! The registries return zeroed records for unknown ids, which this
//! adapter translates into not-found errors so the orchestrator never
//! has to inspect sentinel values.

use alloy_primitives::{Address, U256};
use alloy_provider::RootProvider;
use alloy_sol_types::sol;
use async_trait::async_trait;

use crate::config::ChainConfig;
use crate::domain::chain::ChainGateway;
use crate::domain::error::ServerError;
use crate::domain::permission::{EncryptedKeyHex, FileRecord, GranteeRecord, Permission};

sol! {
    #[sol(rpc)]
    contract DataPermissions {
        struct PermissionInfo {
            uint256 id;
            address grantor;
            uint256 nonce;
            uint256 granteeId;
            string grant;
            uint256 startBlock;
            uint256 endBlock;
            uint256[] fileIds;
        }

        function permissions(uint256 permissionId) external view returns (PermissionInfo memory);
    }
}

sol! {
    #[sol(rpc)]
    contract DataPortabilityGrantees {
        struct GranteeInfo {
            address owner;
            address granteeAddress;
            bytes publicKey;
            uint256[] permissionIds;
        }

        function grantees(uint256 granteeId) external view returns (GranteeInfo memory);
    }
}

sol! {
    #[sol(rpc)]
    contract DataRegistry {
        struct FileResponse {
            uint256 id;
            address ownerAddress;
            string url;
            uint256 addedAtBlock;
        }

        function files(uint256 fileId) external view returns (FileResponse memory);

        function filePermissions(uint256 fileId, address account) external view returns (string memory);
    }
}

pub struct EvmChainGateway {
    provider: RootProvider,
    permissions_address: Address,
    registry_address: Address,
    grantees_address: Address,
}

impl EvmChainGateway {
    pub fn new(config: &ChainConfig) -> Result<Self, ServerError> {
        let url = config
            .rpc_url
            .parse()
            .map_err(|e| ServerError::Validation(format!("invalid chain RPC URL: {e}")))?;

        Ok(Self {
            provider: RootProvider::new_http(url),
            permissions_address: config.permissions_address,
            registry_address: config.registry_address,
            grantees_address: config.grantees_address,
        })
    }

    fn transport(context: &str, err: impl std::fmt::Display) -> ServerError {
        ServerError::Chain(format!("{context}: {err}"))
    }
}

#[async_trait]
impl ChainGateway for EvmChainGateway {
    async fn fetch_permission(&self, id: U256) -> Result<Permission, ServerError> {
        let contract = DataPermissions::new(self.permissions_address, self.provider.clone());
        let info = contract
            .permissions(id)
            .call()
            .await
            .map_err(|e| Self::transport("permissions call failed", e))?;

        if info.grantor == Address::ZERO {
            return Err(ServerError::not_found("Permission", id.to_string()));
        }

        tracing::debug!(
            permission_id = %id,
            grantor = %info.grantor,
            files = info.fileIds.len(),
            "fetched permission"
        );

        Ok(Permission {
            id: info.id,
            grantor: info.grantor,
            nonce: info.nonce,
            grantee_id: info.granteeId,
            grant: info.grant,
            start_block: info.startBlock,
            end_block: info.endBlock,
            file_ids: info.fileIds,
        })
    }

    async fn fetch_grantee(&self, id: U256) -> Result<GranteeRecord, ServerError> {
        let contract = DataPortabilityGrantees::new(self.grantees_address, self.provider.clone());
        let info = contract
            .grantees(id)
            .call()
            .await
            .map_err(|e| Self::transport("grantees call failed", e))?;

        if info.granteeAddress == Address::ZERO {
            return Err(ServerError::not_found("Grantee", id.to_string()));
        }

        Ok(GranteeRecord {
            owner: info.owner,
            grantee_address: info.granteeAddress,
            public_key: info.publicKey.to_vec(),
        })
    }

    async fn fetch_file(&self, id: U256) -> Result<FileRecord, ServerError> {
        let contract = DataRegistry::new(self.registry_address, self.provider.clone());
        let info = contract
            .files(id)
            .call()
            .await
            .map_err(|e| Self::transport("files call failed", e))?;

        if info.ownerAddress == Address::ZERO {
            return Err(ServerError::not_found("File", id.to_string()));
        }

        Ok(FileRecord {
            id: info.id,
            owner_address: info.ownerAddress,
            storage_url: info.url,
            added_at_block: info.addedAtBlock,
        })
    }

    async fn fetch_file_key(
        &self,
        file_id: U256,
        server_address: Address,
    ) -> Result<EncryptedKeyHex, ServerError> {
        let contract = DataRegistry::new(self.registry_address, self.provider.clone());
        let key = contract
            .filePermissions(file_id, server_address)
            .call()
            .await
            .map_err(|e| Self::transport("filePermissions call failed", e))?;

        if key.is_empty() {
            return Err(ServerError::not_found(
                "File key",
                format!("{file_id} for {server_address}"),
            ));
        }

        Ok(EncryptedKeyHex(key))
    }
}
