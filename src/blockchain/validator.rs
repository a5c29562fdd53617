use log::debug;
use thiserror::Error;

use super::account::WalletState;
use super::crypto::Verifier;
use super::transaction::{Transaction, TransactionEnvelope};

/// Reasons a transaction is rejected. None of them is fatal; the caller reports
/// the rejection and the ledger stays untouched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Authentication failure: {0}")]
    AuthenticationFailure(String),

    /// Covers replays and out-of-order submissions alike
    #[error("Invalid nonce: expected {expected}, got {got}")]
    OrderingFailure { expected: u64, got: u64 },

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },
}

/// Checks a submitted envelope against the current state.
///
/// In order: the sender must be the payload's `fromAddress`, the tag must
/// verify against the sender, the payload recovered from the tag must equal the
/// presented one, and the transfer must pass [`check_transfer`].
pub fn validate<V: Verifier>(
    state: &WalletState,
    envelope: &TransactionEnvelope,
    verifier: &V,
) -> Result<(), ValidationError> {
    let payload = &envelope.payload;

    if envelope.sender != payload.from_address {
        return Err(ValidationError::AuthenticationFailure(
            "sender does not match fromAddress".to_string(),
        ));
    }

    let expected = payload
        .canonical_bytes()
        .map_err(|e| ValidationError::AuthenticationFailure(e.to_string()))?;

    if !verifier.verify(&envelope.sender, &envelope.authentication_tag, &expected) {
        return Err(ValidationError::AuthenticationFailure(
            "tag does not verify for sender".to_string(),
        ));
    }

    let recovered = verifier
        .recover(&envelope.sender, &envelope.authentication_tag)
        .map_err(|e| ValidationError::AuthenticationFailure(e.to_string()))?;
    let decoded: Transaction = serde_json::from_slice(&recovered)
        .map_err(|e| ValidationError::AuthenticationFailure(e.to_string()))?;

    if &decoded != payload {
        return Err(ValidationError::AuthenticationFailure(
            "tag encodes a different transaction".to_string(),
        ));
    }

    check_transfer(state, payload)
}

/// Nonce ordering and solvency of a transfer, without authentication.
///
/// An unknown sender has nothing to spend and is rejected as insufficient funds.
pub fn check_transfer(state: &WalletState, transaction: &Transaction) -> Result<(), ValidationError> {
    let Some(sender) = state.get(&transaction.from_address) else {
        debug!("Unknown sender {}", transaction.from_address.short());
        return Err(ValidationError::InsufficientFunds {
            required: transaction.amount,
            available: 0,
        });
    };

    if !sender.is_next_nonce(transaction.nonce) {
        return Err(ValidationError::OrderingFailure {
            expected: sender.nonce.saturating_add(1),
            got: transaction.nonce,
        });
    }

    if !sender.has_sufficient_funds(transaction.amount) {
        return Err(ValidationError::InsufficientFunds {
            required: transaction.amount,
            available: sender.balance,
        });
    }

    Ok(())
}
