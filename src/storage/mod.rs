// Storage layer for the ledger and UTXO index

mod blockchain;
mod utxo_set;

pub use blockchain::{AddBlockOutcome, Blockchain, BlockchainIterator, GENESIS_COINBASE_DATA};
pub use utxo_set::{IndexedOutput, UtxoEntry, UtxoSet};

use crate::core::{Block, Transaction};
use crate::error::Result;
use std::path::Path;

/// Storage manager - ledger and UTXO index sharing one sled database
pub struct Storage {
    db: sled::Db,
    pub blockchain: Blockchain,
    pub utxo_set: UtxoSet,
}

impl Storage {
    /// Open (or create) the database directory at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// Create an in-memory storage (for testing)
    pub fn memory() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        Ok(Self {
            blockchain: Blockchain::open(&db)?,
            utxo_set: UtxoSet::open(&db)?,
            db,
        })
    }

    /// Create the genesis block and index its output
    pub fn create_blockchain(&mut self, address: &str) -> Result<Block> {
        let genesis = self.blockchain.create_genesis(address)?;
        self.utxo_set.reindex(&self.blockchain)?;
        Ok(genesis)
    }

    /// Mine `transactions` on the tip and apply the block to the index
    pub fn mine_block(&mut self, transactions: Vec<Transaction>) -> Result<Block> {
        let block = self.blockchain.mine_block(transactions)?;
        self.utxo_set.update(&block)?;
        Ok(block)
    }

    /// Store a block mined off-lock, then apply it to the index
    pub fn commit_mined(&mut self, block: &Block) -> Result<()> {
        self.blockchain.commit_mined(block)?;
        self.utxo_set.update(block)
    }

    pub fn reindex_utxo(&self) -> Result<usize> {
        self.utxo_set.reindex(&self.blockchain)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
