use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use super::crypto::{Address, AuthTag, CryptoError, Signer};

/// Errors that can occur while building or signing transactions
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Invalid sender address: {0}")]
    InvalidSenderAddress(String),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// A transfer of `amount` from one account to another.
///
/// `nonce` must be exactly one more than the sender's current nonce when the
/// transaction is validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Sender's address
    pub from_address: Address,

    /// Recipient's address
    pub to_address: Address,

    /// Amount being transferred
    pub amount: u64,

    /// Sender's nonce after this transaction
    pub nonce: u64,
}

impl Transaction {
    pub fn new(from_address: Address, to_address: Address, amount: u64, nonce: u64) -> Self {
        Transaction {
            from_address,
            to_address,
            amount,
            nonce,
        }
    }

    /// The exact bytes an authentication tag is produced over (compact JSON, field order fixed)
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, TransactionError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Field concatenation used for the block transactions digest
    pub fn digest_input(&self) -> String {
        format!(
            "{}{}{}{}",
            self.from_address, self.to_address, self.amount, self.nonce
        )
    }
}

/// A transaction as submitted by a client: the payload, who claims to send it and their tag
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TransactionEnvelope {
    /// Address of the signer
    pub sender: Address,

    /// Tag over the payload's canonical bytes
    #[serde(rename = "encryptedTransaction")]
    pub authentication_tag: AuthTag,

    /// The transaction itself
    #[serde(rename = "plaintextTransaction")]
    pub payload: Transaction,
}

impl TransactionEnvelope {
    /// Signs a transaction on behalf of its sender
    pub fn sign<S: Signer>(payload: Transaction, signer: &S) -> Result<Self, TransactionError> {
        if signer.address() != &payload.from_address {
            return Err(TransactionError::InvalidSenderAddress(
                "Signer address does not match fromAddress".to_string(),
            ));
        }

        let authentication_tag = signer.sign(&payload.canonical_bytes()?)?;

        Ok(TransactionEnvelope {
            sender: signer.address().clone(),
            authentication_tag,
            payload,
        })
    }
}
