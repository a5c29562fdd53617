use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

use super::transaction::Transaction;

/// `prevBlockHash` of the genesis block
pub const GENESIS_PREV_HASH: &str = "0";

/// Represents a block in the chain.
///
/// A block is open while `block_hash` is empty and accepts transactions; the
/// miner fills in the digest, nonce and hash to seal it, after which it never
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Height of the block in the chain
    pub block_number: u64,

    /// Transactions in the order they were accepted
    pub transactions: Vec<Transaction>,

    /// Hash of the previous block
    pub prev_block_hash: String,

    /// Digest of the transactions, set when sealed
    #[serde(rename = "transactionHashed")]
    pub transactions_digest: String,

    /// Proof of work nonce, set when sealed
    #[serde(rename = "blockNonce")]
    pub seal_nonce: String,

    /// Hash of the sealed block
    pub block_hash: String,
}

impl Block {
    /// Creates an empty open block
    pub fn open(block_number: u64, prev_block_hash: String) -> Self {
        Block {
            block_number,
            transactions: Vec::new(),
            prev_block_hash,
            transactions_digest: String::new(),
            seal_nonce: String::new(),
            block_hash: String::new(),
        }
    }

    pub fn genesis() -> Self {
        Block::open(0, GENESIS_PREV_HASH.to_string())
    }

    pub fn is_sealed(&self) -> bool {
        !self.block_hash.is_empty()
    }

    /// Digest of the block's current transactions
    pub fn calculate_digest(&self) -> String {
        hash_transactions(&self.transactions)
    }

    /// Hash derived from the stored fields, ignoring the stored `block_hash`
    pub fn calculate_hash(&self) -> String {
        block_hash(
            &self.prev_block_hash,
            self.block_number,
            &self.transactions_digest,
            &self.seal_nonce,
        )
    }
}

/// SHA-256 over the concatenated fields of every transaction
pub fn hash_transactions(transactions: &[Transaction]) -> String {
    let input: String = transactions.iter().map(Transaction::digest_input).collect();
    sha256_hex(&input)
}

/// `H(prev_block_hash ‖ block_number ‖ digest ‖ nonce)`
pub fn block_hash(prev_block_hash: &str, block_number: u64, digest: &str, nonce: &str) -> String {
    sha256_hex(&format!("{}{}{}{}", prev_block_hash, block_number, digest, nonce))
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Address;

    fn transaction(amount: u64, nonce: u64) -> Transaction {
        Transaction::new(
            Address("from".to_string()),
            Address("to".to_string()),
            amount,
            nonce,
        )
    }

    #[test]
    fn test_genesis_block() {
        let block = Block::genesis();

        assert_eq!(block.block_number, 0);
        assert_eq!(block.prev_block_hash, GENESIS_PREV_HASH);
        assert!(block.transactions.is_empty());
        assert!(!block.is_sealed());
    }

    #[test]
    fn test_hash_transactions() {
        let digest = hash_transactions(&[transaction(10, 1), transaction(20, 2)]);

        assert_eq!(digest.len(), 64); // SHA-256 hash is 64 characters in hex
        assert_eq!(digest, sha256_hex("fromto101fromto202"));
        assert_ne!(digest, hash_transactions(&[transaction(20, 2), transaction(10, 1)]));

        // Empty string digest
        assert_eq!(
            hash_transactions(&[]),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_calculate_hash_uses_stored_fields() {
        let mut block = Block::open(3, "abc".to_string());
        block.transactions.push(transaction(5, 1));
        block.transactions_digest = block.calculate_digest();
        block.seal_nonce = "ff".to_string();

        assert_eq!(
            block.calculate_hash(),
            sha256_hex(&format!("abc3{}ff", block.transactions_digest))
        );
    }

    #[test]
    fn test_wire_names() {
        let value = serde_json::to_value(Block::genesis()).unwrap();

        for key in [
            "blockNumber",
            "transactions",
            "prevBlockHash",
            "transactionHashed",
            "blockNonce",
            "blockHash",
        ] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
    }
}
