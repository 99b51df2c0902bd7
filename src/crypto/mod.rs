//! Cryptographic Operations Module
//!
//! This module holds the witness key and produces the secp256k1 signatures the
//! validator contract checks. The signed message is the 32-byte transfer id
//! itself (already a keccak256 digest), signed as a prehash with RFC6979
//! deterministic nonces, so re-signing the same id yields the same bytes.
//!
//! ## Security Requirements
//!
//! **CRITICAL**: The private key must never be logged. Only the derived
//! address is safe to print.

use ethereum_types::{Address, H256};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};
use tracing::debug;

use crate::error::{WitnessError, WitnessResult};

/// Length of an encoded witness signature: `r || s || v`.
pub const SIGNATURE_LENGTH: usize = 65;

// ============================================================================
// SIGNER IMPLEMENTATION
// ============================================================================

/// Produces witness signatures over transfer ids.
pub trait Signer: Send + Sync {
    /// Address the validator contract knows this witness by.
    fn address(&self) -> Address;

    /// Signs a transfer id.
    ///
    /// # Returns
    ///
    /// * `Ok(Vec<u8>)` - 65 bytes `r || s || v` with `v` in {0, 1}
    /// * `Err(WitnessError::Signing)` - The key refused the digest
    fn sign(&self, id: &H256) -> WitnessResult<Vec<u8>>;
}

/// Witness signer backed by a secp256k1 private key.
pub struct WitnessSigner {
    signing_key: SigningKey,
    address: Address,
}

impl WitnessSigner {
    /// Creates a signer from a hex-encoded private key.
    ///
    /// # Arguments
    ///
    /// * `private_key_hex` - 32-byte private key as hex, `0x` prefix optional
    ///
    /// # Returns
    ///
    /// * `Ok(WitnessSigner)` - Signer ready to use
    /// * `Err(WitnessError::Configuration)` - Key is not valid hex or not a valid scalar
    pub fn from_hex(private_key_hex: &str) -> WitnessResult<Self> {
        let trimmed = private_key_hex.trim();
        let stripped = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(stripped)
            .map_err(|e| WitnessError::Configuration(format!("Invalid private key hex: {}", e)))?;

        if bytes.len() != 32 {
            return Err(WitnessError::Configuration(format!(
                "Invalid private key length: expected 32 bytes, got {}",
                bytes.len()
            )));
        }

        let signing_key = SigningKey::from_slice(&bytes)
            .map_err(|e| WitnessError::Configuration(format!("Invalid private key: {}", e)))?;
        let address = address_of(signing_key.verifying_key());

        Ok(Self {
            signing_key,
            address,
        })
    }
}

impl Signer for WitnessSigner {
    fn address(&self) -> Address {
        self.address
    }

    /// Signs the id as a prehash; RFC6979 makes the result deterministic.
    fn sign(&self, id: &H256) -> WitnessResult<Vec<u8>> {
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(id.as_bytes())
            .map_err(|e| WitnessError::Signing(format!("Failed to sign {:?}: {}", id, e)))?;

        let mut encoded = Vec::with_capacity(SIGNATURE_LENGTH);
        encoded.extend_from_slice(&signature.to_bytes());
        encoded.push(recovery_id.to_byte());

        debug!("Signed transfer id {:?}", id);
        Ok(encoded)
    }
}

/// Recovers the signer address from a witness signature over `id`.
///
/// Accepts `v` as either {0, 1} or the legacy {27, 28}.
pub fn recover(id: &H256, signature: &[u8]) -> WitnessResult<Address> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(WitnessError::Signing(format!(
            "Invalid signature length: expected {} bytes, got {}",
            SIGNATURE_LENGTH,
            signature.len()
        )));
    }

    let v = match signature[64] {
        v @ (0 | 1) => v,
        v @ (27 | 28) => v - 27,
        other => {
            return Err(WitnessError::Signing(format!(
                "Invalid recovery byte {}",
                other
            )))
        }
    };
    let recovery_id = RecoveryId::from_byte(v)
        .ok_or_else(|| WitnessError::Signing(format!("Invalid recovery byte {}", v)))?;
    let sig = Signature::from_slice(&signature[..64])
        .map_err(|e| WitnessError::Signing(format!("Invalid signature: {}", e)))?;

    let key = VerifyingKey::recover_from_prehash(id.as_bytes(), &sig, recovery_id)
        .map_err(|e| WitnessError::Signing(format!("Failed to recover signer: {}", e)))?;
    Ok(address_of(&key))
}

/// Ethereum address: last 20 bytes of keccak256 over the uncompressed key without its 0x04 tag.
fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}
