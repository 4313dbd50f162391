// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! On-chain entities read by the operations pipeline.
//!
//! These are plain data carriers: the chain gateway decodes contract
//! return values into them and the orchestrator consumes them. Nothing
//! here is ever written back to the chain.

use alloy_primitives::{Address, U256};

/// A data-access permission recorded on the permissions registry.
#[derive(Debug, Clone)]
pub struct Permission {
    pub id: U256,
    /// The user who owns the data and signed the grant.
    pub grantor: Address,
    pub nonce: U256,
    /// Registry id of the grantee application record.
    pub grantee_id: U256,
    /// Content-addressed URI of the grant file.
    pub grant: String,
    pub start_block: U256,
    pub end_block: U256,
    /// Files covered by this permission, in declared order.
    pub file_ids: Vec<U256>,
}

/// A grantee application record from the grantees registry.
#[derive(Debug, Clone)]
pub struct GranteeRecord {
    pub owner: Address,
    pub grantee_address: Address,
    /// SEC1 public key bytes as registered by the application.
    pub public_key: Vec<u8>,
}

/// File registration from the data registry, joined with the encrypted
/// payload key sealed to a specific server identity.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: U256,
    pub owner_address: Address,
    pub storage_url: String,
    pub added_at_block: U256,
}

/// Hex-encoded ECIES envelope holding a file's payload key, sealed to
/// one server address via the registry's file-permissions mapping.
#[derive(Debug, Clone)]
pub struct EncryptedKeyHex(pub String);

impl EncryptedKeyHex {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
