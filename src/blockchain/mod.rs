// Blockchain module
//
// This module contains the ledger core:
// - Identities, authentication tags and addresses
// - Transactions and the envelopes clients submit
// - Account state and transaction validation
// - Blocks, the chain and chain validation
// - Proof of work
// - The ledger that ties them together, and its storage

pub mod account;
pub mod block;
pub mod chain;
pub mod crypto;
pub mod ledger;
pub mod miner;
pub mod storage;
pub mod transaction;
pub mod validator;

// Re-export main components for easier access
pub use account::Account;
pub use block::Block;
pub use crypto::{Address, AuthTag, Wallet};
pub use ledger::{Ledger, LedgerError};
pub use transaction::{Transaction, TransactionEnvelope};
