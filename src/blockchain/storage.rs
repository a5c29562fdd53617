use std::path::Path;

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Batch, Db, Tree};
use thiserror::Error;

use super::account::WalletState;
use super::chain::Chain;

const SNAPSHOT_TREE: &str = "snapshot";
const GENESIS_KEY: &str = "genesis";
const WALLETS_KEY: &str = "wallets";
const CHAIN_KEY: &str = "chain";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Item not found: {0}")]
    NotFound(String),
}

/// Everything needed to restore a ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Allocation the state was built from, needed to replay foreign chains
    pub genesis: WalletState,

    pub state: WalletState,

    pub chain: Chain,
}

/// Durable store holding the latest ledger snapshot
pub struct LedgerStorage {
    /// The database instance
    db: Db,

    /// Tree holding the snapshot parts
    snapshot: Tree,
}

impl std::fmt::Debug for LedgerStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerStorage").finish()
    }
}

impl LedgerStorage {
    /// Opens (or creates) the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let snapshot = db.open_tree(SNAPSHOT_TREE)?;
        Ok(Self { db, snapshot })
    }

    /// Replaces the stored snapshot in a single atomic batch and flushes it to disk
    pub fn save_snapshot(
        &self,
        genesis: &WalletState,
        state: &WalletState,
        chain: &Chain,
    ) -> Result<(), StorageError> {
        let mut batch = Batch::default();
        batch.insert(GENESIS_KEY, encode(genesis)?);
        batch.insert(WALLETS_KEY, encode(state)?);
        batch.insert(CHAIN_KEY, encode(chain)?);

        self.snapshot.apply_batch(batch)?;
        self.db.flush()?;

        debug!("Saved snapshot with {} blocks and {} accounts", chain.len(), state.len());
        Ok(())
    }

    /// Reads the stored snapshot
    pub fn load_snapshot(&self) -> Result<Snapshot, StorageError> {
        Ok(Snapshot {
            genesis: self.get(GENESIS_KEY)?,
            state: self.get(WALLETS_KEY)?,
            chain: self.get(CHAIN_KEY)?,
        })
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StorageError> {
        match self.snapshot.get(key)? {
            Some(value) => bincode::deserialize(&value)
                .map_err(|e| StorageError::DeserializationError(format!("{}: {}", key, e))),
            None => Err(StorageError::NotFound(format!("No {} stored", key))),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::miner::Miner;
    use crate::blockchain::{Address, Transaction};

    use std::thread;
    use std::time::Duration;

    // sled releases the file lock from a background thread after the last handle drops
    fn reopen(path: &Path) -> LedgerStorage {
        for _ in 0..100 {
            match LedgerStorage::open(path) {
                Ok(storage) => return storage,
                Err(_) => thread::sleep(Duration::from_millis(20)),
            }
        }
        LedgerStorage::open(path).unwrap()
    }

    #[test]
    fn test_empty_storage_is_not_found() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let storage = LedgerStorage::from_db(db).unwrap();

        assert!(matches!(
            storage.load_snapshot(),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let alice = Address("alice".to_string());
        let bob = Address("bob".to_string());

        let genesis = WalletState::with_genesis(&[(alice.clone(), 100)]).unwrap();
        let mut state = genesis.clone();
        let mut chain = Chain::new();
        let miner = Miner::default();

        for nonce in 1..=11 {
            let transaction = Transaction::new(alice.clone(), bob.clone(), 2, nonce);
            state.apply(&transaction);
            chain.append_transaction(transaction, &miner, 10).unwrap();
        }

        {
            let storage = LedgerStorage::open(dir.path()).unwrap();
            storage.save_snapshot(&genesis, &state, &chain).unwrap();
        }

        let storage = reopen(dir.path());
        let snapshot = storage.load_snapshot().unwrap();

        assert_eq!(snapshot.genesis, genesis);
        assert_eq!(snapshot.state, state);
        assert_eq!(snapshot.chain, chain);
        assert!(snapshot.chain.blocks()[0].is_sealed());
    }
}
