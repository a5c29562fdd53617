use clap::Parser;

use std::path::PathBuf;

use crate::blockchain::chain::DEFAULT_BLOCK_THRESHOLD;
use crate::blockchain::crypto::DEFAULT_KEY_BITS;
use crate::blockchain::miner::DEFAULT_DIFFICULTY;

/// Parameters of a ledger instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Leading zero hex digits a block hash needs
    pub difficulty: usize,

    /// Transactions an open block may hold before it is sealed
    pub block_threshold: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            difficulty: DEFAULT_DIFFICULTY,
            block_threshold: DEFAULT_BLOCK_THRESHOLD,
        }
    }
}

/// Command line and environment configuration of the node
#[derive(Debug, Clone, Parser)]
#[command(name = "rsa-ledger")]
#[command(about = "Single-node ledger with RSA-authenticated transactions and proof of work", long_about = None)]
pub struct NodeConfig {
    /// Address the HTTP server binds to
    #[arg(long, env = "LEDGER_BIND", default_value = "127.0.0.1")]
    pub bind: String,

    /// Port the HTTP server listens on
    #[arg(long, env = "LEDGER_PORT", default_value_t = 2828)]
    pub port: u16,

    /// Directory of the ledger database
    #[arg(long, env = "LEDGER_DATA_DIR", default_value = "data/ledger")]
    pub data_dir: PathBuf,

    /// Keep the ledger in memory only
    #[arg(long, env = "LEDGER_IN_MEMORY")]
    pub in_memory: bool,

    /// PEM file holding the node's private key; generated if missing
    #[arg(long, env = "LEDGER_KEY_PATH", default_value = "keys/private.pem")]
    pub key_path: PathBuf,

    /// RSA modulus size in bits
    #[arg(long, env = "LEDGER_KEY_BITS", default_value_t = DEFAULT_KEY_BITS)]
    pub key_bits: usize,

    /// Leading zero hex digits required in a block hash
    #[arg(
        long,
        env = "LEDGER_DIFFICULTY",
        default_value_t = DEFAULT_DIFFICULTY as u32,
        value_parser = clap::value_parser!(u32).range(0..=64)
    )]
    pub difficulty: u32,

    /// Transactions an open block may hold before it is sealed
    #[arg(long, env = "LEDGER_BLOCK_SIZE", default_value_t = DEFAULT_BLOCK_THRESHOLD)]
    pub block_size: usize,

    /// Base URL of a node to pull the chain from, e.g. http://127.0.0.1:2829
    #[arg(long, env = "LEDGER_PEER")]
    pub peer: Option<String>,

    /// Genesis balance credited to the node's own address
    #[arg(long, env = "LEDGER_INITIAL_BALANCE", default_value_t = 1000)]
    pub initial_balance: u64,
}

impl NodeConfig {
    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            difficulty: self.difficulty as usize,
            block_threshold: self.block_size,
        }
    }
}
