// Ledger of blocks on sled

use crate::core::{Block, Hash256, Serializable, Transaction};
use crate::error::{Error, Result};
use crate::storage::{IndexedOutput, UtxoEntry};
use secp256k1::SecretKey;
use sled::Tree;
use sled::transaction::TransactionResult;
use std::collections::{HashMap, HashSet};

/// Key holding the hash of the highest block
const TIP_KEY: &[u8] = b"l";

/// Data carried by the genesis coinbase
pub const GENESIS_COINBASE_DATA: &str = "Testing";

/// What `add_block` did with a received block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddBlockOutcome {
    /// Block was already stored
    Duplicate,
    /// Stored, tip unchanged
    Stored,
    /// Stored and became the new tip
    NewTip,
}

/// Append-only block store with a tip pointer
pub struct Blockchain {
    blocks: Tree,
    tip: Option<Hash256>,
}

impl Blockchain {
    const TREE_NAME: &'static str = "blocks";

    /// Open the ledger. An empty store gives a ledger without a tip.
    pub fn open(db: &sled::Db) -> Result<Self> {
        let blocks = db.open_tree(Self::TREE_NAME)?;
        let tip = match blocks.get(TIP_KEY)? {
            Some(bytes) => Some(
                Hash256::from_slice(&bytes)
                    .ok_or_else(|| Error::Corrupted(format!("tip of {} bytes", bytes.len())))?,
            ),
            None => None,
        };

        Ok(Self { blocks, tip })
    }

    /// Mine and store the genesis block paying `address`
    pub fn create_genesis(&mut self, address: &str) -> Result<Block> {
        if self.tip.is_some() {
            return Err(Error::LedgerExists);
        }

        let coinbase = Transaction::new_coinbase(address, GENESIS_COINBASE_DATA, None)?;
        let genesis = Block::genesis(coinbase)?;
        self.store(&genesis, true)?;

        log::info!("Created ledger with genesis block {}", genesis.hash);
        Ok(genesis)
    }

    pub fn tip_hash(&self) -> Option<Hash256> {
        self.tip
    }

    pub fn is_empty(&self) -> bool {
        self.tip.is_none()
    }

    /// Height of the tip block, `None` for an empty ledger
    pub fn best_height(&self) -> Result<Option<u64>> {
        match self.tip {
            Some(tip) => Ok(Some(self.get_block(&tip)?.height)),
            None => Ok(None),
        }
    }

    pub fn has_block(&self, hash: &Hash256) -> Result<bool> {
        Ok(self.blocks.contains_key(hash.as_bytes())?)
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Block> {
        match self.blocks.get(hash.as_bytes())? {
            Some(bytes) => Block::from_bytes(&bytes),
            None => Err(Error::BlockNotFound(hash.to_string())),
        }
    }

    /// Walk the chain backward from the tip
    pub fn iter(&self) -> BlockchainIterator<'_> {
        BlockchainIterator {
            chain: self,
            next: self.tip,
        }
    }

    pub fn find_block_by_height(&self, height: u64) -> Result<Block> {
        for block in self.iter() {
            let block = block?;
            if block.height == height {
                return Ok(block);
            }
        }
        Err(Error::BlockNotFound(format!("height {}", height)))
    }

    pub fn find_transaction(&self, id: &Hash256) -> Result<Transaction> {
        for block in self.iter() {
            if let Some(tx) = block?.transactions.into_iter().find(|tx| tx.id == *id) {
                return Ok(tx);
            }
        }
        Err(Error::TransactionNotFound(*id))
    }

    /// Hashes of every block on the chain, tip first
    pub fn block_hashes(&self) -> Result<Vec<Hash256>> {
        self.iter().map(|block| block.map(|b| b.hash)).collect()
    }

    /// Every block on the chain, genesis first
    pub fn blocks_from_genesis(&self) -> Result<Vec<Block>> {
        let mut blocks = self.iter().collect::<Result<Vec<_>>>()?;
        blocks.reverse();
        Ok(blocks)
    }

    /// Transactions referenced by the inputs of `tx`
    pub fn find_prev_transactions(&self, tx: &Transaction) -> Result<HashMap<Hash256, Transaction>> {
        let mut prev_txs = HashMap::new();
        if tx.is_coinbase() {
            return Ok(prev_txs);
        }

        for input in &tx.inputs {
            if !prev_txs.contains_key(&input.txid) {
                prev_txs.insert(input.txid, self.find_transaction(&input.txid)?);
            }
        }
        Ok(prev_txs)
    }

    pub fn sign_transaction(&self, tx: &mut Transaction, secret_key: &SecretKey) -> Result<()> {
        let prev_txs = self.find_prev_transactions(tx)?;
        tx.sign(secret_key, &prev_txs)
    }

    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        let prev_txs = self.find_prev_transactions(tx)?;
        tx.verify(&prev_txs)
    }

    /// Parent hash and height for the next block on the tip
    pub fn next_block_position(&self) -> Result<(Hash256, u64)> {
        let tip = self.tip.ok_or(Error::EmptyLedger)?;
        Ok((tip, self.get_block(&tip)?.height + 1))
    }

    /// Check signatures and value balance of `tx` against the ledger.
    ///
    /// Fails with `TransactionNotFound` when a parent is not on chain,
    /// `InvalidSignature` or `InvalidTransaction` otherwise.
    pub fn validate_transaction(&self, tx: &Transaction) -> Result<()> {
        if tx.is_coinbase() {
            return Ok(());
        }

        let prev_txs = self.find_prev_transactions(tx)?;
        if !tx.verify(&prev_txs)? {
            return Err(Error::InvalidSignature(tx.id));
        }
        tx.check_balance(&prev_txs)
    }

    /// Check every transaction before it goes into a new block
    pub fn verify_block_transactions(&self, transactions: &[Transaction]) -> Result<()> {
        for tx in transactions {
            match self.validate_transaction(tx) {
                Ok(()) => {}
                Err(Error::TransactionNotFound(missing)) => {
                    return Err(Error::InvalidTransaction {
                        id: tx.id,
                        reason: format!("spends unknown transaction {}", missing),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Verify `transactions`, mine them on the tip and store the block
    pub fn mine_block(&mut self, transactions: Vec<Transaction>) -> Result<Block> {
        self.verify_block_transactions(&transactions)?;
        let (prev_hash, height) = self.next_block_position()?;

        let block = Block::new(transactions, prev_hash, height)?;
        self.commit_mined(&block)?;
        Ok(block)
    }

    /// Store a block mined by this node. It must extend the current tip.
    pub fn commit_mined(&mut self, block: &Block) -> Result<()> {
        let tip = self.tip.unwrap_or_default();
        if block.prev_hash != tip {
            return Err(Error::StaleBlock {
                hash: block.hash,
                expected: block.prev_hash,
                tip,
            });
        }
        if !block.has_valid_pow()? {
            return Err(Error::InvalidProofOfWork(block.hash));
        }

        self.store(block, true)
    }

    /// Store a block received from a peer.
    ///
    /// The tip moves only when the block is higher than the current tip.
    pub fn add_block(&mut self, block: &Block) -> Result<AddBlockOutcome> {
        if !block.has_valid_pow()? {
            return Err(Error::InvalidProofOfWork(block.hash));
        }
        if self.has_block(&block.hash)? {
            return Ok(AddBlockOutcome::Duplicate);
        }

        let advance = match self.best_height()? {
            Some(height) => block.height > height,
            None => true,
        };
        self.store(block, advance)?;

        log::info!(
            "Added block {} at height {}{}",
            block.hash,
            block.height,
            if advance { " (new tip)" } else { "" }
        );

        Ok(if advance {
            AddBlockOutcome::NewTip
        } else {
            AddBlockOutcome::Stored
        })
    }

    /// Every unspent output reachable from the tip, computed by a full scan
    pub fn find_all_utxo(&self) -> Result<HashMap<Hash256, UtxoEntry>> {
        let mut utxos: HashMap<Hash256, UtxoEntry> = HashMap::new();
        let mut spent: HashSet<(Hash256, i64)> = HashSet::new();

        // Spenders always sit at the same height or above, so collecting a
        // block's inputs before its outputs covers spends within one block.
        for block in self.iter() {
            let block = block?;

            for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
                spent.extend(tx.inputs.iter().map(|i| (i.txid, i.output_index)));
            }

            for tx in &block.transactions {
                let outputs: Vec<IndexedOutput> = tx
                    .outputs
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !spent.contains(&(tx.id, *i as i64)))
                    .map(|(i, out)| IndexedOutput::new(i as u32, out.clone()))
                    .collect();

                if !outputs.is_empty() {
                    utxos.insert(tx.id, UtxoEntry { outputs });
                }
            }
        }

        Ok(utxos)
    }

    /// Persist `block` and, if `advance`, the tip pointer in one transaction
    fn store(&mut self, block: &Block, advance: bool) -> Result<()> {
        let bytes = block.to_bytes()?;
        let key = block.hash.as_bytes().as_slice();

        let result: TransactionResult<(), Error> = self.blocks.transaction(|tree| {
            tree.insert(key, bytes.as_slice())?;
            if advance {
                tree.insert(TIP_KEY, key)?;
            }
            Ok(())
        });
        result?;

        if advance {
            self.tip = Some(block.hash);
        }
        Ok(())
    }
}

/// Backward iterator over the chain, tip to genesis
pub struct BlockchainIterator<'a> {
    chain: &'a Blockchain,
    next: Option<Hash256>,
}

impl Iterator for BlockchainIterator<'_> {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.next.take()?;
        match self.chain.get_block(&hash) {
            Ok(block) => {
                if !block.is_genesis() {
                    self.next = Some(block.prev_hash);
                }
                Some(Ok(block))
            }
            Err(e) => Some(Err(e)),
        }
    }
}
