use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use std::collections::BTreeMap;

use super::crypto::Address;
use super::transaction::Transaction;

/// Errors that can occur during account operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccountError {
    #[error("Genesis allocation exceeds the maximum supply")]
    SupplyOverflow,
}

/// Represents an account's state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Account {
    /// Number of transactions the account has sent
    pub nonce: u64,

    /// The account's balance
    pub balance: u64,
}

impl Account {
    /// Checks if the account has sufficient funds
    pub fn has_sufficient_funds(&self, amount: u64) -> bool {
        self.balance >= amount
    }

    /// Checks if `nonce` is the next one this account may use
    pub fn is_next_nonce(&self, nonce: u64) -> bool {
        self.nonce.checked_add(1) == Some(nonce)
    }
}

/// Balances and nonces of every known account.
///
/// Only genesis allocations and applied transactions change it, so the total
/// supply is fixed at construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletState {
    accounts: BTreeMap<Address, Account>,
}

impl WalletState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a state holding the given allocations.
    ///
    /// Repeated addresses are summed; the whole supply must fit in a `u64`.
    pub fn with_genesis(allocations: &[(Address, u64)]) -> Result<Self, AccountError> {
        let mut state = WalletState::new();
        let mut supply: u64 = 0;

        for (address, balance) in allocations {
            supply = supply.checked_add(*balance).ok_or(AccountError::SupplyOverflow)?;
            state.accounts.entry(address.clone()).or_default().balance += *balance;
        }

        Ok(state)
    }

    pub fn get(&self, address: &Address) -> Option<&Account> {
        self.accounts.get(address)
    }

    /// Nonce the next transaction from `address` must carry
    pub fn next_nonce(&self, address: &Address) -> u64 {
        self.get(address)
            .map_or(0, |account| account.nonce)
            .saturating_add(1)
    }

    /// Applies a transaction that has already been validated.
    ///
    /// The recipient is created with the transferred amount if it is unknown.
    pub fn apply(&mut self, transaction: &Transaction) {
        let sender = self
            .accounts
            .entry(transaction.from_address.clone())
            .or_default();
        sender.nonce += 1;
        sender.balance = sender.balance.saturating_sub(transaction.amount);

        let recipient = self
            .accounts
            .entry(transaction.to_address.clone())
            .or_default();
        recipient.balance = recipient.balance.saturating_add(transaction.amount);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, &Account)> {
        self.accounts.iter()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Sum of all balances
    pub fn total_supply(&self) -> u128 {
        self.accounts.values().map(|a| u128::from(a.balance)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(name: &str) -> Address {
        Address(name.to_string())
    }

    #[test]
    fn test_account_creation() {
        let account = Account { nonce: 0, balance: 100 };

        assert_eq!(account.balance, 100);
        assert_eq!(account.nonce, 0);
        assert!(account.has_sufficient_funds(100));
        assert!(!account.has_sufficient_funds(101));
        assert!(account.is_next_nonce(1));
        assert!(!account.is_next_nonce(0));
        assert!(!account.is_next_nonce(2));
    }

    #[test]
    fn test_genesis_allocation() {
        let state = WalletState::with_genesis(&[
            (address("a"), 60),
            (address("b"), 10),
            (address("a"), 40),
        ])
        .unwrap();

        assert_eq!(state.len(), 2);
        assert_eq!(state.get(&address("a")).unwrap().balance, 100);
        assert_eq!(state.total_supply(), 110);

        let overflow = WalletState::with_genesis(&[(address("a"), u64::MAX), (address("b"), 1)]);
        assert_eq!(overflow, Err(AccountError::SupplyOverflow));
    }

    #[test]
    fn test_apply_transfers_and_conserves_supply() {
        let mut state = WalletState::with_genesis(&[(address("a"), 100), (address("b"), 5)]).unwrap();
        let before = state.total_supply();

        state.apply(&Transaction::new(address("a"), address("b"), 30, 1));

        assert_eq!(state.get(&address("a")), Some(&Account { nonce: 1, balance: 70 }));
        assert_eq!(state.get(&address("b")), Some(&Account { nonce: 0, balance: 35 }));
        assert_eq!(state.next_nonce(&address("a")), 2);
        assert_eq!(state.next_nonce(&address("z")), 1);
        assert_eq!(state.total_supply(), before);
    }

    #[test]
    fn test_apply_creates_recipient() {
        let mut state = WalletState::with_genesis(&[(address("a"), 100)]).unwrap();
        assert!(state.get(&address("c")).is_none());

        state.apply(&Transaction::new(address("a"), address("c"), 25, 1));

        assert_eq!(state.get(&address("c")), Some(&Account { nonce: 0, balance: 25 }));
    }

    #[test]
    fn test_self_transfer_only_bumps_nonce() {
        let mut state = WalletState::with_genesis(&[(address("a"), 100)]).unwrap();

        state.apply(&Transaction::new(address("a"), address("a"), 40, 1));

        assert_eq!(state.get(&address("a")), Some(&Account { nonce: 1, balance: 100 }));
    }
}
