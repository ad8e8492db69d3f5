// Minimal UTXO cryptocurrency node

pub mod cli;
pub mod config;
pub mod consensus;
pub mod core;
pub mod error;
pub mod network;
pub mod storage;
pub mod wallet;

// Re-exports for convenience
pub use cli::{Cli, CliHandler, Commands};
pub use config::NodeConfig;
pub use consensus::{ProofOfWork, Target};
pub use core::{Block, Hash256, Transaction, TxInput, TxOutput};
pub use error::{Error, Result};
pub use network::{Message, Node};
pub use storage::{Blockchain, Storage, UtxoSet};
pub use wallet::{Wallet, Wallets};
