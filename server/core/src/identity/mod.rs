// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! Deterministic per-user server identity.
//!
//! Every user address maps to a BIP44 account index derived from the
//! SHA-256 of the lowercased address string; the server mnemonic plus
//! that index yields the personal server's keypair. The same user always
//! resolves to the same identity, and the private key only ever lives on
//! the stack of the caller that needed it.

use alloy_primitives::Address;
use alloy_signer_local::coins_bip39::English;
use alloy_signer_local::MnemonicBuilder;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::domain::error::ServerError;

/// Derived identity for one user's personal server.
///
/// The secret key zeroizes on drop; callers must not clone it into
/// longer-lived state.
pub struct ServerIdentity {
    pub secret: k256::SecretKey,
    /// SEC1 uncompressed public key (0x04 ‖ X ‖ Y).
    pub public_key: [u8; 65],
    pub address: Address,
}

impl ServerIdentity {
    pub fn public_key_hex(&self) -> String {
        format!("0x{}", hex::encode(self.public_key))
    }
}

pub struct IdentityService {
    mnemonic: Zeroizing<String>,
}

impl IdentityService {
    /// `language` is validated eagerly; only the English wordlist is
    /// shipped.
    pub fn new(mnemonic: impl Into<String>, language: &str) -> Result<Self, ServerError> {
        if !language.eq_ignore_ascii_case("english") {
            return Err(ServerError::Validation(format!(
                "unsupported mnemonic language: {language}"
            )));
        }
        Ok(Self {
            mnemonic: Zeroizing::new(mnemonic.into()),
        })
    }

    /// Map a user address onto its BIP44 account index:
    /// big-endian `SHA-256(lowercased address string)[..4]` mod 2^31.
    pub fn derivation_index(user_address: Address) -> u32 {
        let lowered = user_address.to_string().to_lowercase();
        let digest = Sha256::digest(lowered.as_bytes());
        let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        head % (1 << 31)
    }

    /// Derive the personal-server identity for `user_address`.
    pub fn derive(&self, user_address: Address) -> Result<ServerIdentity, ServerError> {
        let index = Self::derivation_index(user_address);
        let path = format!("m/44'/60'/0'/0/{index}");

        let signer = MnemonicBuilder::<English>::default()
            .phrase(self.mnemonic.as_str())
            .derivation_path(&path)
            .map_err(|e| ServerError::Internal(format!("invalid derivation path: {e}")))?
            .build()
            .map_err(|e| ServerError::Internal(format!("key derivation failed: {e}")))?;

        let signing_key = signer.credential();
        let secret = k256::SecretKey::from_bytes(&signing_key.to_bytes())
            .map_err(|e| ServerError::Internal(format!("key derivation failed: {e}")))?;

        let encoded = signing_key.verifying_key().to_encoded_point(false);
        let mut public_key = [0u8; 65];
        public_key.copy_from_slice(encoded.as_bytes());

        Ok(ServerIdentity {
            secret,
            public_key,
            address: signer.address(),
        })
    }

    /// Derive from a caller-supplied address string, rejecting malformed
    /// input with a validation error.
    pub fn derive_for(&self, user_address: &str) -> Result<ServerIdentity, ServerError> {
        let address: Address = user_address
            .parse()
            .map_err(|_| ServerError::Validation(format!("invalid address: {user_address}")))?;
        self.derive(address)
    }
}
