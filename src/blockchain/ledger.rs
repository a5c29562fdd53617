use log::{debug, info, warn};
use thiserror::Error;

use std::path::Path;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::account::{Account, AccountError, WalletState};
use super::block::Block;
use super::chain::{Chain, ChainError};
use super::crypto::{Address, RawRsa, Signer};
use super::miner::{CancelToken, Miner, MinerError};
use super::storage::{LedgerStorage, StorageError};
use super::transaction::{Transaction, TransactionEnvelope, TransactionError};
use super::validator::{self, ValidationError};
use crate::config::LedgerConfig;

/// Errors that can occur during ledger operations
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Transaction rejected: {0}")]
    Rejected(#[from] ValidationError),

    #[error("Invalid chain: {0}")]
    InvalidChain(#[from] ChainError),

    #[error("Chain of {candidate} blocks is not longer than the local chain of {local} blocks")]
    ChainNotLonger { local: usize, candidate: usize },

    #[error("Stored snapshot is inconsistent: {0}")]
    CorruptSnapshot(String),

    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Account error: {0}")]
    AccountError(#[from] AccountError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Mining error: {0}")]
    MiningError(#[from] MinerError),

    #[error("System error: {0}")]
    SystemError(String),
}

/// Outcome of an accepted transaction
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    /// Block the transaction was recorded in
    pub block_number: u64,

    /// The block sealed because of this transaction, if any
    pub sealed_block: Option<Block>,
}

#[derive(Debug)]
struct LedgerInner {
    chain: Chain,
    state: WalletState,
}

/// A ledger instance: one chain and the account state derived from it.
///
/// Validation, state updates and chain appends happen under a single write
/// lock. Mining runs without the lock and only the final seal is committed
/// under it. Clones share the same ledger.
#[derive(Debug, Clone)]
pub struct Ledger {
    inner: Arc<RwLock<LedgerInner>>,

    /// Allocation the state started from
    genesis: Arc<WalletState>,

    miner: Miner,

    block_threshold: usize,

    verifier: RawRsa,

    /// Token of the search currently allowed to run
    mining: Arc<Mutex<CancelToken>>,

    storage: Option<Arc<LedgerStorage>>,
}

impl Ledger {
    /// Creates an in-memory ledger with an open genesis block
    pub fn new(config: LedgerConfig, genesis: &[(Address, u64)]) -> Result<Self, LedgerError> {
        let genesis = WalletState::with_genesis(genesis)?;
        Ok(Self::assemble(config, genesis.clone(), genesis, Chain::new(), None))
    }

    /// Creates a ledger backed by the database at `storage_path`
    pub fn with_storage<P: AsRef<Path>>(
        config: LedgerConfig,
        genesis: &[(Address, u64)],
        storage_path: P,
    ) -> Result<Self, LedgerError> {
        let storage = LedgerStorage::open(storage_path)?;
        Self::open(config, genesis, Arc::new(storage))
    }

    /// Creates a ledger on top of an open storage.
    ///
    /// An existing snapshot is loaded and `genesis` is ignored; otherwise a
    /// fresh ledger is created from `genesis` and saved. A snapshot whose chain
    /// does not validate, or whose balances differ from a replay of its chain,
    /// is refused.
    pub fn open(
        config: LedgerConfig,
        genesis: &[(Address, u64)],
        storage: Arc<LedgerStorage>,
    ) -> Result<Self, LedgerError> {
        match storage.load_snapshot() {
            Ok(snapshot) => {
                snapshot.chain.validate(config.difficulty)?;
                if snapshot.chain.replay(&snapshot.genesis)? != snapshot.state {
                    return Err(LedgerError::CorruptSnapshot(
                        "stored balances do not match the stored chain".to_string(),
                    ));
                }

                info!(
                    "Loaded ledger with {} blocks, {} accounts and a supply of {} from storage",
                    snapshot.chain.len(),
                    snapshot.state.len(),
                    snapshot.state.total_supply()
                );

                Ok(Self::assemble(
                    config,
                    snapshot.genesis,
                    snapshot.state,
                    snapshot.chain,
                    Some(storage),
                ))
            }
            Err(StorageError::NotFound(_)) => {
                info!("No existing ledger found in storage, creating genesis block");
                let genesis = WalletState::with_genesis(genesis)?;
                let chain = Chain::new();
                storage.save_snapshot(&genesis, &genesis, &chain)?;

                Ok(Self::assemble(config, genesis.clone(), genesis, chain, Some(storage)))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn assemble(
        config: LedgerConfig,
        genesis: WalletState,
        state: WalletState,
        chain: Chain,
        storage: Option<Arc<LedgerStorage>>,
    ) -> Self {
        Ledger {
            inner: Arc::new(RwLock::new(LedgerInner { chain, state })),
            genesis: Arc::new(genesis),
            miner: Miner::new(config.difficulty),
            block_threshold: config.block_threshold,
            verifier: RawRsa,
            mining: Arc::new(Mutex::new(CancelToken::new())),
            storage,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, LedgerInner>, LedgerError> {
        self.inner
            .read()
            .map_err(|_| LedgerError::SystemError("ledger lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, LedgerInner>, LedgerError> {
        self.inner
            .write()
            .map_err(|_| LedgerError::SystemError("ledger lock poisoned".to_string()))
    }

    fn persist(&self, state: &WalletState, chain: &Chain) -> Result<(), LedgerError> {
        if let Some(storage) = &self.storage {
            storage.save_snapshot(&self.genesis, state, chain)?;
        }
        Ok(())
    }

    /// Validates a transaction and, if it passes, applies it and records it in the open block.
    ///
    /// A rejected or unrecorded transaction leaves both state and chain as they
    /// were. If the open block grows past the threshold it is sealed before this
    /// returns.
    pub fn submit(&self, envelope: TransactionEnvelope) -> Result<SubmitReceipt, LedgerError> {
        self.record(|_| Ok(envelope))
    }

    /// Signs a transfer from `signer` at its next nonce and records it.
    ///
    /// The nonce is read under the same write lock that records the
    /// transaction, so concurrent transfers from one signer never collide.
    pub fn transfer<S: Signer>(
        &self,
        signer: &S,
        to_address: Address,
        amount: u64,
    ) -> Result<SubmitReceipt, LedgerError> {
        self.record(|state| {
            let from_address = signer.address().clone();
            let nonce = state.next_nonce(&from_address);
            let transaction = Transaction::new(from_address, to_address, amount, nonce);

            Ok(TransactionEnvelope::sign(transaction, signer)?)
        })
    }

    fn record<F>(&self, build: F) -> Result<SubmitReceipt, LedgerError>
    where
        F: FnOnce(&WalletState) -> Result<TransactionEnvelope, LedgerError>,
    {
        let (block_number, to_seal) = {
            let mut guard = self.write()?;
            let inner = &mut *guard;

            let envelope = build(&inner.state)?;
            validator::validate(&inner.state, &envelope, &self.verifier)?;

            let transaction = envelope.payload;
            let mut next_state = inner.state.clone();
            next_state.apply(&transaction);

            debug!(
                "Accepting transfer of {} from {} with nonce {}",
                transaction.amount,
                transaction.from_address.short(),
                transaction.nonce
            );
            let block_number = inner.chain.push_transaction(transaction);

            if let Err(err) = self.persist(&next_state, &inner.chain) {
                inner.chain.pop_transaction();
                return Err(err);
            }
            inner.state = next_state;

            // Taken under the lock so a chain replacement cannot slip in between
            let to_seal = inner
                .chain
                .block_to_seal(self.block_threshold)
                .map(|block| self.mining_token().map(|cancel| (block.clone(), cancel)));

            (block_number, to_seal)
        };

        info!("Transaction recorded in block {}", block_number);

        // The transaction is committed from here on; a failed seal is retried by a later submit
        let sealed_block = match to_seal {
            Some(job) => match job.and_then(|(block, cancel)| self.seal_open_block(block, &cancel)) {
                Ok(sealed) => sealed,
                Err(err) => {
                    warn!("Block {} left open: {}", block_number, err);
                    None
                }
            },
            None => None,
        };

        Ok(SubmitReceipt {
            block_number,
            sealed_block,
        })
    }

    /// Mines `block` outside the lock and commits the seal if the open block is unchanged.
    ///
    /// If more transactions arrived meanwhile the search restarts with the new
    /// contents; if another caller sealed the block first there is nothing to do.
    fn seal_open_block(&self, block: Block, cancel: &CancelToken) -> Result<Option<Block>, LedgerError> {
        let mut candidate = block;

        loop {
            let sealed = match self.miner.seal(&candidate, cancel) {
                Ok(sealed) => sealed,
                Err(MinerError::Cancelled { attempts }) => {
                    warn!(
                        "Mining of block {} cancelled after {} attempts",
                        candidate.block_number, attempts
                    );
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            };

            let mut guard = self.write()?;
            let inner = &mut *guard;
            let previous = inner.chain.clone();

            if inner.chain.commit_seal(sealed.clone()) {
                if let Err(err) = self.persist(&inner.state, &inner.chain) {
                    inner.chain = previous;
                    return Err(err);
                }

                info!(
                    "Sealed block {} with hash {}",
                    sealed.block_number, sealed.block_hash
                );
                return Ok(Some(sealed));
            }

            match inner.chain.block_to_seal(self.block_threshold) {
                Some(open) if open.block_number == candidate.block_number => {
                    debug!("Block {} changed while mining, retrying", open.block_number);
                    candidate = open.clone();
                }
                _ => return Ok(None),
            }
        }
    }

    fn mining_token(&self) -> Result<CancelToken, LedgerError> {
        self.mining
            .lock()
            .map(|token| token.clone())
            .map_err(|_| LedgerError::SystemError("mining lock poisoned".to_string()))
    }

    /// Stops any running search and arms a fresh token for the next one
    fn cancel_mining(&self) -> Result<(), LedgerError> {
        let mut token = self
            .mining
            .lock()
            .map_err(|_| LedgerError::SystemError("mining lock poisoned".to_string()))?;

        token.cancel();
        *token = CancelToken::new();
        Ok(())
    }

    /// Replaces the local chain with `blocks` if they form a valid chain that is
    /// longer than the local one and whose transactions replay from genesis.
    ///
    /// On any failure the local ledger is kept unchanged. A search running for
    /// the old open block is cancelled.
    pub fn replace_chain(&self, blocks: Vec<Block>) -> Result<(), LedgerError> {
        let candidate = Chain::from_blocks(blocks);

        candidate.validate(self.miner.difficulty())?;
        let state = candidate.replay(&self.genesis)?;

        let mut guard = self.write()?;
        let inner = &mut *guard;

        if candidate.len() <= inner.chain.len() {
            return Err(LedgerError::ChainNotLonger {
                local: inner.chain.len(),
                candidate: candidate.len(),
            });
        }

        self.persist(&state, &candidate)?;
        self.cancel_mining()?;

        info!(
            "Replaced local chain of {} blocks with chain of {} blocks",
            inner.chain.len(),
            candidate.len()
        );
        inner.chain = candidate;
        inner.state = state;

        Ok(())
    }

    /// Gets the entire chain, sealed blocks and the open block
    pub fn chain(&self) -> Result<Vec<Block>, LedgerError> {
        Ok(self.read()?.chain.blocks().to_vec())
    }

    /// The chain together with whether it validates, both read under one lock
    pub fn chain_snapshot(&self) -> Result<(Vec<Block>, bool), LedgerError> {
        let inner = self.read()?;
        Ok((
            inner.chain.blocks().to_vec(),
            inner.chain.is_valid(self.miner.difficulty()),
        ))
    }

    /// Validates the local chain
    pub fn is_valid(&self) -> Result<bool, LedgerError> {
        Ok(self.read()?.chain.is_valid(self.miner.difficulty()))
    }

    pub fn account(&self, address: &Address) -> Result<Option<Account>, LedgerError> {
        Ok(self.read()?.state.get(address).copied())
    }

    /// Gets all accounts
    pub fn accounts(&self) -> Result<Vec<(Address, Account)>, LedgerError> {
        Ok(self
            .read()?
            .state
            .iter()
            .map(|(address, account)| (address.clone(), *account))
            .collect())
    }

    pub fn difficulty(&self) -> usize {
        self.miner.difficulty()
    }

    pub fn block_threshold(&self) -> usize {
        self.block_threshold
    }
}
