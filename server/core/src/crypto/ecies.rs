// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! ECIES envelope seal/unseal over secp256k1.
//!
//! Wire format (hex-encoded on chain and in artifact metadata):
//!
//! ```text
//! IV(16) ‖ ephemeral_pubkey(65, SEC1 uncompressed) ‖ ciphertext ‖ HMAC-SHA256(32)
//! ```
//!
//! Key derivation: ECDH x-coordinate → SHA-512 → first 32 bytes AES-256
//! key, last 32 bytes MAC key. The MAC covers `IV ‖ ephemeral_pubkey ‖
//! ciphertext`. MAC and padding failures both surface as the opaque
//! [`ServerError::Decryption`] so the two are indistinguishable to a
//! caller.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use rand::RngCore;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::domain::error::ServerError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<sha2::Sha256>;

const IV_LEN: usize = 16;
const EPHEMERAL_PUB_LEN: usize = 65;
const MAC_LEN: usize = 32;
const AES_BLOCK_LEN: usize = 16;

/// AES key + MAC key derived from an ECDH shared point.
fn derive_keys(shared_x: &[u8]) -> Zeroizing<[u8; 64]> {
    let mut out = Zeroizing::new([0u8; 64]);
    out.copy_from_slice(&Sha512::digest(shared_x));
    out
}

fn mac_tag(mac_key: &[u8], iv: &[u8], ephemeral_pub: &[u8], ciphertext: &[u8]) -> [u8; MAC_LEN] {
    let mut mac = HmacSha256::new_from_slice(mac_key).expect("HMAC accepts any key length");
    mac.update(iv);
    mac.update(ephemeral_pub);
    mac.update(ciphertext);
    mac.finalize().into_bytes().into()
}

/// Unseal an envelope with the recipient's private key, recovering the
/// payload key it carries.
pub fn unseal(sealed_hex: &str, recipient: &SecretKey) -> Result<Zeroizing<Vec<u8>>, ServerError> {
    let sealed = hex::decode(sealed_hex.trim_start_matches("0x")).map_err(|e| {
        tracing::debug!(error = %e, "envelope hex decode failed");
        ServerError::Decryption
    })?;

    if sealed.len() < IV_LEN + EPHEMERAL_PUB_LEN + MAC_LEN + AES_BLOCK_LEN {
        return Err(ServerError::Decryption);
    }

    let (iv, rest) = sealed.split_at(IV_LEN);
    let (ephemeral_pub, rest) = rest.split_at(EPHEMERAL_PUB_LEN);
    let (ciphertext, tag) = rest.split_at(rest.len() - MAC_LEN);

    let ephemeral =
        PublicKey::from_sec1_bytes(ephemeral_pub).map_err(|_| ServerError::Decryption)?;

    let shared = k256::ecdh::diffie_hellman(recipient.to_nonzero_scalar(), ephemeral.as_affine());
    let keys = derive_keys(shared.raw_secret_bytes().as_slice());
    let (enc_key, mac_key) = keys.split_at(32);

    let expected = mac_tag(mac_key, iv, ephemeral_pub, ciphertext);
    if !bool::from(expected.as_slice().ct_eq(tag)) {
        return Err(ServerError::Decryption);
    }

    let plaintext = Aes256CbcDec::new_from_slices(enc_key, iv)
        .map_err(|_| ServerError::Decryption)?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| ServerError::Decryption)?;

    Ok(Zeroizing::new(plaintext))
}

/// Seal a payload key to a recipient public key. Inverse of [`unseal`].
pub fn seal(payload: &[u8], recipient: &PublicKey) -> Result<String, ServerError> {
    let mut rng = rand::rngs::OsRng;

    let ephemeral = SecretKey::random(&mut rng);
    let ephemeral_pub = ephemeral.public_key().to_sec1_bytes_uncompressed();

    let shared = k256::ecdh::diffie_hellman(ephemeral.to_nonzero_scalar(), recipient.as_affine());
    let keys = derive_keys(shared.raw_secret_bytes().as_slice());
    let (enc_key, mac_key) = keys.split_at(32);

    let mut iv = [0u8; IV_LEN];
    rng.fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new_from_slices(enc_key, &iv)
        .expect("AES-256-CBC accepts 32-byte key and 16-byte IV")
        .encrypt_padded_vec_mut::<Pkcs7>(payload);

    let tag = mac_tag(mac_key, &iv, &ephemeral_pub, &ciphertext);

    let mut sealed = Vec::with_capacity(IV_LEN + EPHEMERAL_PUB_LEN + ciphertext.len() + MAC_LEN);
    sealed.extend_from_slice(&iv);
    sealed.extend_from_slice(&ephemeral_pub);
    sealed.extend_from_slice(&ciphertext);
    sealed.extend_from_slice(&tag);

    Ok(hex::encode(sealed))
}

/// SEC1 uncompressed encoding helper.
trait Sec1Uncompressed {
    fn to_sec1_bytes_uncompressed(&self) -> [u8; EPHEMERAL_PUB_LEN];
}

impl Sec1Uncompressed for PublicKey {
    fn to_sec1_bytes_uncompressed(&self) -> [u8; EPHEMERAL_PUB_LEN] {
        let point = self.to_encoded_point(false);
        let mut out = [0u8; EPHEMERAL_PUB_LEN];
        out.copy_from_slice(point.as_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (SecretKey, PublicKey) {
        let sk = SecretKey::random(&mut rand::rngs::OsRng);
        let pk = sk.public_key();
        (sk, pk)
    }

    #[test]
    fn seal_unseal_round_trip() {
        let (sk, pk) = keypair();
        let payload = b"a fresh 256-bit symmetric key...";

        let sealed = seal(payload, &pk).unwrap();
        let recovered = unseal(&sealed, &sk).unwrap();
        assert_eq!(recovered.as_slice(), payload);
    }

    #[test]
    fn accepts_0x_prefixed_hex() {
        let (sk, pk) = keypair();
        let sealed = format!("0x{}", seal(b"key", &pk).unwrap());
        assert_eq!(unseal(&sealed, &sk).unwrap().as_slice(), b"key");
    }

    #[test]
    fn any_single_bit_flip_fails() {
        let (sk, pk) = keypair();
        let sealed = seal(b"payload key material", &pk).unwrap();
        let mut bytes = hex::decode(&sealed).unwrap();

        // Flip one bit in every region: IV, ephemeral key, ciphertext, MAC.
        for idx in [0usize, 20, IV_LEN + EPHEMERAL_PUB_LEN + 1, bytes.len() - 1] {
            bytes[idx] ^= 0x01;
            let tampered = hex::encode(&bytes);
            assert!(
                matches!(unseal(&tampered, &sk), Err(ServerError::Decryption)),
                "flip at byte {idx} must fail"
            );
            bytes[idx] ^= 0x01;
        }
    }

    #[test]
    fn wrong_recipient_fails() {
        let (_, pk) = keypair();
        let (other_sk, _) = keypair();

        let sealed = seal(b"secret", &pk).unwrap();
        assert!(matches!(
            unseal(&sealed, &other_sk),
            Err(ServerError::Decryption)
        ));
    }

    #[test]
    fn truncated_envelope_fails() {
        let (sk, pk) = keypair();
        let sealed = seal(b"secret", &pk).unwrap();
        assert!(matches!(
            unseal(&sealed[..64], &sk),
            Err(ServerError::Decryption)
        ));
        assert!(matches!(unseal("zz", &sk), Err(ServerError::Decryption)));
    }
}
