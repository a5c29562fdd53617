use log::debug;
use rand::RngCore;
use thiserror::Error;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::block::{block_hash, Block};

/// Leading zero hex digits required when none is configured
pub const DEFAULT_DIFFICULTY: usize = 1;

/// Random bytes per candidate nonce
const NONCE_BYTES: usize = 50;

/// Errors that can occur while mining
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MinerError {
    #[error("Mining cancelled after {attempts} attempts")]
    Cancelled { attempts: u64 },

    #[error("Block {0} is already sealed")]
    AlreadySealed(u64),
}

/// Shared flag that stops a running search
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Returns true if `hash` starts with `difficulty` zero hex digits
pub fn meets_difficulty(hash: &str, difficulty: usize) -> bool {
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}

/// Seals blocks by searching for a nonce whose block hash has enough leading zeros
#[derive(Debug, Clone, Copy)]
pub struct Miner {
    difficulty: usize,
}

impl Default for Miner {
    fn default() -> Self {
        Miner::new(DEFAULT_DIFFICULTY)
    }
}

impl Miner {
    pub fn new(difficulty: usize) -> Self {
        Miner { difficulty }
    }

    pub fn difficulty(&self) -> usize {
        self.difficulty
    }

    /// Returns a sealed copy of `block`.
    ///
    /// Candidate nonces are random, so the search has no upper bound; it only
    /// stops early when `cancel` is triggered.
    pub fn seal(&self, block: &Block, cancel: &CancelToken) -> Result<Block, MinerError> {
        if block.is_sealed() {
            return Err(MinerError::AlreadySealed(block.block_number));
        }

        let digest = block.calculate_digest();
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; NONCE_BYTES];
        let mut attempts: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(MinerError::Cancelled { attempts });
            }

            rng.fill_bytes(&mut bytes);
            let nonce = hex::encode(bytes);
            let hash = block_hash(&block.prev_block_hash, block.block_number, &digest, &nonce);
            attempts += 1;

            if meets_difficulty(&hash, self.difficulty) {
                debug!(
                    "Sealed block {} after {} attempts",
                    block.block_number, attempts
                );

                return Ok(Block {
                    transactions_digest: digest,
                    seal_nonce: nonce,
                    block_hash: hash,
                    ..block.clone()
                });
            }
        }
    }
}
