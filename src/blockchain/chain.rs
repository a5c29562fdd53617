use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::account::WalletState;
use super::block::{block_hash, hash_transactions, Block, GENESIS_PREV_HASH};
use super::miner::{meets_difficulty, CancelToken, Miner, MinerError};
use super::transaction::Transaction;
use super::validator::{check_transfer, ValidationError};

/// Number of transactions an open block may hold before it is sealed
pub const DEFAULT_BLOCK_THRESHOLD: usize = 10;

/// Ways a chain fails validation. Any one of them rejects the whole chain.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("Chain has no blocks")]
    Empty,

    #[error("Block at index {index} has number {found}")]
    BlockNumber { index: usize, found: u64 },

    #[error("Genesis block has parent hash {found}")]
    GenesisParent { found: String },

    #[error("Block {index} is open but is not the last block")]
    OpenBlockNotAtTip { index: usize },

    #[error("Block {index} does not link to its predecessor's hash")]
    BrokenLink { index: usize },

    #[error("Block {index} transactions digest does not match its transactions")]
    DigestMismatch { index: usize },

    #[error("Block {index} hash does not match its contents")]
    HashMismatch { index: usize },

    #[error("Block {index} hash does not meet difficulty {difficulty}")]
    InsufficientWork { index: usize, difficulty: usize },

    #[error("Transaction {position} of block {block} cannot be replayed: {source}")]
    InvalidTransaction {
        block: u64,
        position: usize,
        source: ValidationError,
    },
}

/// Hash-linked sequence of blocks. Index 0 is genesis and the last block may be open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Chain {
    blocks: Vec<Block>,
}

impl Default for Chain {
    fn default() -> Self {
        Chain::new()
    }
}

impl Chain {
    /// Creates a chain holding only an open genesis block
    pub fn new() -> Self {
        Chain {
            blocks: vec![Block::genesis()],
        }
    }

    /// Wraps blocks received from elsewhere; nothing is checked until [`Chain::validate`]
    pub fn from_blocks(blocks: Vec<Block>) -> Self {
        Chain { blocks }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// The block still accepting transactions, if the tail is open
    pub fn open_block(&self) -> Option<&Block> {
        self.blocks.last().filter(|block| !block.is_sealed())
    }

    /// Pushes a transaction into the open block and returns that block's number.
    ///
    /// A new open block is started first if the tail is sealed.
    pub fn push_transaction(&mut self, transaction: Transaction) -> u64 {
        if self.open_block().is_none() {
            let next = match self.blocks.last() {
                Some(last) => Block::open(last.block_number + 1, last.block_hash.clone()),
                None => Block::genesis(),
            };
            self.blocks.push(next);
        }

        match self.blocks.last_mut() {
            Some(open) => {
                open.transactions.push(transaction);
                open.block_number
            }
            None => 0,
        }
    }

    /// Removes the most recently pushed transaction from the open block
    pub fn pop_transaction(&mut self) -> Option<Transaction> {
        match self.blocks.last_mut() {
            Some(block) if !block.is_sealed() => block.transactions.pop(),
            _ => None,
        }
    }

    /// The open block, once it holds more than `threshold` transactions
    pub fn block_to_seal(&self, threshold: usize) -> Option<&Block> {
        self.open_block()
            .filter(|block| block.transactions.len() > threshold)
    }

    /// Replaces the open block with its sealed form and starts the next open block.
    ///
    /// Returns false, leaving the chain untouched, if `sealed` was mined from
    /// contents that no longer match the open block.
    pub fn commit_seal(&mut self, sealed: Block) -> bool {
        let matches_tip = self.open_block().map_or(false, |open| {
            sealed.is_sealed()
                && open.block_number == sealed.block_number
                && open.prev_block_hash == sealed.prev_block_hash
                && open.transactions == sealed.transactions
        });

        if !matches_tip {
            return false;
        }

        let next = Block::open(sealed.block_number + 1, sealed.block_hash.clone());
        if let Some(tip) = self.blocks.last_mut() {
            *tip = sealed;
        }
        self.blocks.push(next);

        true
    }

    /// Pushes a transaction and, if the open block is now over `threshold`,
    /// seals it in place. Returns the sealed block, if any.
    pub fn append_transaction(
        &mut self,
        transaction: Transaction,
        miner: &Miner,
        threshold: usize,
    ) -> Result<Option<Block>, MinerError> {
        self.push_transaction(transaction);

        let Some(open) = self.block_to_seal(threshold) else {
            return Ok(None);
        };
        let sealed = miner.seal(open, &CancelToken::new())?;
        if !self.commit_seal(sealed.clone()) {
            return Ok(None);
        }

        info!(
            "Sealed block {} with hash {}",
            sealed.block_number, sealed.block_hash
        );
        Ok(Some(sealed))
    }

    /// Re-derives every hash link and seal in the chain.
    ///
    /// For each block after genesis, the previous block's hash is recomputed
    /// from its raw fields and must equal this block's `prev_block_hash`, and a
    /// sealed block's hash is recomputed from the previous block's hash and this
    /// block's transactions. Every sealed block must also carry a matching
    /// digest and a hash that meets `difficulty`. Only the last block may be open.
    pub fn validate(&self, difficulty: usize) -> Result<(), ChainError> {
        let Some(genesis) = self.blocks.first() else {
            return Err(ChainError::Empty);
        };
        if genesis.prev_block_hash != GENESIS_PREV_HASH {
            return Err(ChainError::GenesisParent {
                found: genesis.prev_block_hash.clone(),
            });
        }

        let last = self.blocks.len() - 1;
        for (index, block) in self.blocks.iter().enumerate() {
            if block.block_number != index as u64 {
                return Err(ChainError::BlockNumber {
                    index,
                    found: block.block_number,
                });
            }

            if !block.is_sealed() {
                if index != last {
                    return Err(ChainError::OpenBlockNotAtTip { index });
                }
                continue;
            }

            if block.transactions_digest != block.calculate_digest() {
                return Err(ChainError::DigestMismatch { index });
            }
            if block.block_hash != block.calculate_hash() {
                return Err(ChainError::HashMismatch { index });
            }
            if !meets_difficulty(&block.block_hash, difficulty) {
                return Err(ChainError::InsufficientWork { index, difficulty });
            }
        }

        for (index, pair) in self.blocks.windows(2).enumerate() {
            let (prev, block) = (&pair[0], &pair[1]);
            let index = index + 1;

            if block.prev_block_hash != prev.calculate_hash() {
                return Err(ChainError::BrokenLink { index });
            }

            // The open tip has no seal yet
            if block.is_sealed() {
                let expected = block_hash(
                    &prev.block_hash,
                    block.block_number,
                    &hash_transactions(&block.transactions),
                    &block.seal_nonce,
                );

                if expected != block.block_hash {
                    return Err(ChainError::HashMismatch { index });
                }
            }
        }

        Ok(())
    }

    pub fn is_valid(&self, difficulty: usize) -> bool {
        self.validate(difficulty).is_ok()
    }

    /// Rebuilds the account state by applying every transaction, in order, on top of `genesis`
    pub fn replay(&self, genesis: &WalletState) -> Result<WalletState, ChainError> {
        let mut state = genesis.clone();

        for block in &self.blocks {
            for (position, transaction) in block.transactions.iter().enumerate() {
                check_transfer(&state, transaction).map_err(|source| {
                    ChainError::InvalidTransaction {
                        block: block.block_number,
                        position,
                        source,
                    }
                })?;
                state.apply(transaction);
            }
        }

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Address;

    const DIFFICULTY: usize = 1;

    fn transaction(nonce: u64) -> Transaction {
        Transaction::new(
            Address("alice".to_string()),
            Address("bob".to_string()),
            1,
            nonce,
        )
    }

    /// Two sealed blocks followed by an open block with one transaction
    fn sample_chain() -> Chain {
        let miner = Miner::new(DIFFICULTY);
        let mut chain = Chain::new();

        for nonce in 1..=23 {
            chain.append_transaction(transaction(nonce), &miner, 10).unwrap();
        }

        assert_eq!(chain.len(), 3);
        chain
    }

    #[test]
    fn test_new_chain() {
        let chain = Chain::new();

        assert_eq!(chain.len(), 1);
        assert_eq!(chain.blocks()[0].block_number, 0);
        assert!(chain.open_block().is_some());
        assert!(chain.is_valid(DIFFICULTY));
    }

    #[test]
    fn test_block_is_sealed_after_threshold() {
        let miner = Miner::new(DIFFICULTY);
        let mut chain = Chain::new();

        for nonce in 1..=10 {
            let sealed = chain.append_transaction(transaction(nonce), &miner, 10).unwrap();
            assert!(sealed.is_none());
        }
        assert_eq!(chain.len(), 1);

        let sealed = chain
            .append_transaction(transaction(11), &miner, 10)
            .unwrap()
            .expect("eleventh transaction seals the block");

        assert_eq!(chain.len(), 2);
        let first = &chain.blocks()[0];
        assert_eq!(first, &sealed);
        assert!(first.is_sealed());
        assert_eq!(first.transactions.len(), 11);
        assert!(meets_difficulty(&first.block_hash, DIFFICULTY));

        let open = chain.open_block().unwrap();
        assert_eq!(open.block_number, 1);
        assert_eq!(open.prev_block_hash, first.block_hash);
        assert!(open.transactions.is_empty());

        assert!(chain.is_valid(DIFFICULTY));
    }

    #[test]
    fn test_commit_seal_rejects_stale_block() {
        let miner = Miner::new(DIFFICULTY);
        let mut chain = Chain::new();
        chain.push_transaction(transaction(1));

        let stale = miner.seal(chain.open_block().unwrap(), &CancelToken::new()).unwrap();
        chain.push_transaction(transaction(2));

        assert!(!chain.commit_seal(stale));
        assert_eq!(chain.len(), 1);

        let fresh = miner.seal(chain.open_block().unwrap(), &CancelToken::new()).unwrap();
        assert!(chain.commit_seal(fresh));
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_pop_transaction() {
        let mut chain = Chain::new();
        chain.push_transaction(transaction(1));

        assert_eq!(chain.pop_transaction(), Some(transaction(1)));
        assert_eq!(chain.pop_transaction(), None);
        assert_eq!(chain, Chain::new());
    }

    #[test]
    fn test_sample_chain_is_valid() {
        let chain = sample_chain();
        assert_eq!(chain.validate(DIFFICULTY), Ok(()));
    }

    #[test]
    fn test_validation_is_idempotent() {
        let chain = sample_chain();
        let copy = chain.clone();

        assert!(chain.is_valid(DIFFICULTY));
        assert!(chain.is_valid(DIFFICULTY));
        assert_eq!(chain, copy);

        let mut tampered = chain.blocks().to_vec();
        tampered[1].transactions[0].amount = 99;
        let tampered = Chain::from_blocks(tampered);
        assert_eq!(tampered.validate(DIFFICULTY), tampered.validate(DIFFICULTY));
    }

    #[test]
    fn test_tampered_transaction_is_detected() {
        for block in 0..2 {
            let mut blocks = sample_chain().blocks().to_vec();
            blocks[block].transactions[3].amount ^= 1;

            assert!(!Chain::from_blocks(blocks).is_valid(DIFFICULTY), "block {}", block);
        }
    }

    #[test]
    fn test_tampered_prev_hash_is_detected() {
        for block in 0..3 {
            let mut blocks = sample_chain().blocks().to_vec();
            blocks[block].prev_block_hash.push('0');

            assert!(!Chain::from_blocks(blocks).is_valid(DIFFICULTY), "block {}", block);
        }
    }

    #[test]
    fn test_tampered_block_number_is_detected() {
        let mut blocks = sample_chain().blocks().to_vec();
        blocks[1].block_number ^= 1;

        assert!(!Chain::from_blocks(blocks).is_valid(DIFFICULTY));
    }

    #[test]
    fn test_tampered_seal_nonce_is_detected() {
        for block in 0..2 {
            let mut blocks = sample_chain().blocks().to_vec();
            let mut nonce = hex::decode(&blocks[block].seal_nonce).unwrap();
            nonce[0] ^= 0x01;
            blocks[block].seal_nonce = hex::encode(nonce);

            assert!(!Chain::from_blocks(blocks).is_valid(DIFFICULTY), "block {}", block);
        }
    }

    #[test]
    fn test_rewritten_predecessor_is_detected() {
        let mut blocks = sample_chain().blocks().to_vec();

        // Change a transaction and rewrite the block's digest and hash to match
        blocks[0].transactions[0].amount = 50;
        blocks[0].transactions_digest = blocks[0].calculate_digest();
        blocks[0].block_hash = blocks[0].calculate_hash();

        let result = Chain::from_blocks(blocks).validate(0);
        assert_eq!(result, Err(ChainError::BrokenLink { index: 1 }));
    }

    #[test]
    fn test_open_block_must_be_last() {
        let mut blocks = sample_chain().blocks().to_vec();
        blocks[1].block_hash.clear();

        assert_eq!(
            Chain::from_blocks(blocks).validate(DIFFICULTY),
            Err(ChainError::OpenBlockNotAtTip { index: 1 })
        );
    }

    #[test]
    fn test_empty_chain_is_invalid() {
        assert_eq!(Chain::from_blocks(Vec::new()).validate(DIFFICULTY), Err(ChainError::Empty));
    }

    #[test]
    fn test_genesis_must_have_root_parent() {
        let mut blocks = sample_chain().blocks().to_vec();
        blocks[0].prev_block_hash = "ff".repeat(32);

        assert_eq!(
            Chain::from_blocks(blocks).validate(DIFFICULTY),
            Err(ChainError::GenesisParent { found: "ff".repeat(32) })
        );
    }

    #[test]
    fn test_block_to_seal_follows_threshold() {
        let mut chain = Chain::new();
        for nonce in 1..=3 {
            chain.push_transaction(transaction(nonce));
        }

        assert!(chain.block_to_seal(3).is_none());
        assert_eq!(chain.block_to_seal(2).map(|block| block.block_number), Some(0));

        let sealed = Miner::new(DIFFICULTY)
            .seal(chain.block_to_seal(2).unwrap(), &CancelToken::new())
            .unwrap();
        assert!(chain.commit_seal(sealed));
        assert!(chain.block_to_seal(0).is_none());
    }

    #[test]
    fn test_insufficient_work_is_detected() {
        let chain = sample_chain();
        let harder = DIFFICULTY + 8;

        assert!(matches!(
            chain.validate(harder),
            Err(ChainError::InsufficientWork { index: 0, .. })
        ));
    }

    #[test]
    fn test_replay_rebuilds_state() {
        let chain = sample_chain();
        let genesis = WalletState::with_genesis(&[(Address("alice".to_string()), 100)]).unwrap();

        let state = chain.replay(&genesis).unwrap();
        let alice = state.get(&Address("alice".to_string())).unwrap();
        let bob = state.get(&Address("bob".to_string())).unwrap();

        assert_eq!(alice.nonce, 23);
        assert_eq!(alice.balance, 77);
        assert_eq!(bob.balance, 23);
    }

    #[test]
    fn test_replay_rejects_overspend() {
        let chain = sample_chain();
        let genesis = WalletState::with_genesis(&[(Address("alice".to_string()), 5)]).unwrap();

        assert!(matches!(
            chain.replay(&genesis),
            Err(ChainError::InvalidTransaction { block: 0, position: 5, .. })
        ));
    }
}
