// Error types for the node

use crate::core::Hash256;
use sled::transaction::TransactionError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Block hash does not satisfy the difficulty target
    #[error("Invalid proof of work for block {0}")]
    InvalidProofOfWork(Hash256),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(Hash256),

    #[error("Block not found: {0}")]
    BlockNotFound(String),

    #[error("Insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },

    /// At least one input signature failed to verify
    #[error("Invalid signature in transaction {0}")]
    InvalidSignature(Hash256),

    #[error("Invalid transaction {id}: {reason}")]
    InvalidTransaction { id: Hash256, reason: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(u64),

    #[error("Cannot build a block without transactions")]
    EmptyBlock,

    #[error("Ledger already exists")]
    LedgerExists,

    #[error("Ledger is empty")]
    EmptyLedger,

    /// Block was mined on a tip that is no longer current
    #[error("Stale block {hash}: expected parent {expected}, tip is {tip}")]
    StaleBlock {
        hash: Hash256,
        expected: Hash256,
        tip: Hash256,
    },

    #[error("Nonce space exhausted")]
    MiningExhausted,

    #[error("Mining cancelled")]
    MiningCancelled,

    /// Stored data violates a ledger invariant
    #[error("Corrupted store: {0}")]
    Corrupted(String),

    #[error("Peer {addr} unreachable: {reason}")]
    PeerUnreachable { addr: String, reason: String },

    #[error("Bootstrap from {0} timed out")]
    BootstrapTimeout(String),

    #[error("Unknown command: {0:?}")]
    UnknownCommand(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] sled::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] secp256k1::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<TransactionError<Error>> for Error {
    fn from(err: TransactionError<Error>) -> Self {
        match err {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => Error::Store(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
