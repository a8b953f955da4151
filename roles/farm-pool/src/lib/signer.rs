//! Custodial signing of simulated transactions.
//!
//! The node hands back an assembled transaction plus the authorization entries
//! the source account has to sign. Each entry and the transaction itself are
//! signed with the farmer's ed25519 key, the result is packed into a JSON
//! envelope and base64-encoded for the relay.

use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey};
#[cfg(test)]
use ed25519_dalek::{Verifier, VerifyingKey};
use farm_rpc::SimulateResponse;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{FarmPoolError, PoolResult};

/// A farmer's custodial ed25519 key, decoded from its hex seed.
pub struct CustodialKey {
    signing: SigningKey,
}

impl std::fmt::Debug for CustodialKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustodialKey")
            .field("public", &self.public_key_hex())
            .finish()
    }
}

impl CustodialKey {
    pub fn from_hex(seed: &str) -> PoolResult<Self> {
        let bytes = hex::decode(seed.trim()).map_err(|e| FarmPoolError::Key(e.to_string()))?;
        let seed: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            FarmPoolError::Key(format!("expected a 32 byte seed, got {} bytes", b.len()))
        })?;
        Ok(Self {
            signing: SigningKey::from_bytes(&seed),
        })
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }
}

#[cfg(test)]
impl CustodialKey {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    pub fn seed_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing.verifying_key().verify(message, signature).is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SignedAuthEntry {
    entry: String,
    signature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SignedEnvelope {
    transaction: String,
    auth: Vec<SignedAuthEntry>,
    signer: String,
    signature: String,
}

/// A transaction ready for the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    /// Base64 of the JSON envelope.
    pub blob: String,
    /// Hex SHA-256 of the envelope, used when the relay reports no hash.
    pub local_hash: String,
}

/// Signs the assembled transaction of a successful simulation.
pub fn sign_transaction(
    key: &CustodialKey,
    simulation: &SimulateResponse,
) -> PoolResult<SignedTransaction> {
    let transaction = simulation
        .transaction
        .clone()
        .ok_or_else(|| FarmPoolError::InvalidState("simulation returned no transaction".into()))?;
    let auth = simulation
        .auth
        .iter()
        .map(|entry| SignedAuthEntry {
            entry: entry.clone(),
            signature: hex::encode(key.sign(entry.as_bytes()).to_bytes()),
        })
        .collect();
    let envelope = SignedEnvelope {
        signature: hex::encode(key.sign(transaction.as_bytes()).to_bytes()),
        transaction,
        auth,
        signer: key.public_key_hex(),
    };
    let json = serde_json::to_vec(&envelope)
        .map_err(|e| FarmPoolError::InvalidState(format!("envelope encoding: {e}")))?;
    Ok(SignedTransaction {
        local_hash: hex::encode(Sha256::digest(&json)),
        blob: base64::engine::general_purpose::STANDARD.encode(json),
    })
}

/// Checks every signature of an envelope produced by [`sign_transaction`].
#[cfg(test)]
pub fn verify_blob(blob: &str) -> bool {
    let Ok(json) = base64::engine::general_purpose::STANDARD.decode(blob) else {
        return false;
    };
    let Ok(envelope) = serde_json::from_slice::<SignedEnvelope>(&json) else {
        return false;
    };
    let Some(signer) = hex::decode(&envelope.signer)
        .ok()
        .and_then(|b| <[u8; 32]>::try_from(b).ok())
        .and_then(|b| VerifyingKey::from_bytes(&b).ok())
    else {
        return false;
    };
    let check = |message: &str, signature: &str| {
        hex::decode(signature)
            .ok()
            .and_then(|b| Signature::from_slice(&b).ok())
            .map(|sig| signer.verify(message.as_bytes(), &sig).is_ok())
            .unwrap_or(false)
    };
    check(&envelope.transaction, &envelope.signature)
        && envelope
            .auth
            .iter()
            .all(|a| check(&a.entry, &a.signature))
}
