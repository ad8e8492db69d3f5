// Block data structures

use crate::consensus::ProofOfWork;
use crate::core::{Hash256, Serializable, Transaction, merkle_root, now};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::AtomicBool;

/// Block - an ordered batch of transactions sealed by proof of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Unix time in seconds when mining started
    pub timestamp: i64,
    pub transactions: Vec<Transaction>,
    /// Hash of the parent block (zero for genesis)
    pub prev_hash: Hash256,
    pub hash: Hash256,
    pub nonce: u64,
    /// Distance from genesis
    pub height: u64,
}

impl Serializable for Block {}

impl Block {
    /// Mine a block on top of `prev_hash`
    pub fn new(transactions: Vec<Transaction>, prev_hash: Hash256, height: u64) -> Result<Self> {
        Self::mine(transactions, prev_hash, height, &AtomicBool::new(false))
    }

    /// Mine a block, giving up with `MiningCancelled` once `cancel` is set
    pub fn mine(
        transactions: Vec<Transaction>,
        prev_hash: Hash256,
        height: u64,
        cancel: &AtomicBool,
    ) -> Result<Self> {
        if transactions.is_empty() {
            return Err(Error::EmptyBlock);
        }

        let mut block = Self {
            timestamp: now(),
            transactions,
            prev_hash,
            hash: Hash256::zero(),
            nonce: 0,
            height,
        };

        let result = ProofOfWork::new(&block)?.run(cancel)?;
        log::info!(
            "Mined block {} at height {} ({} attempts, {:.1} KH/s)",
            result.hash,
            height,
            result.attempts,
            result.hash_rate() / 1000.0
        );

        block.nonce = result.nonce;
        block.hash = result.hash;
        Ok(block)
    }

    /// Create the genesis block around its coinbase
    pub fn genesis(coinbase: Transaction) -> Result<Self> {
        Self::new(vec![coinbase], Hash256::zero(), 0)
    }

    /// Merkle root over the serialized transactions
    pub fn hash_transactions(&self) -> Result<Hash256> {
        let serialized = self
            .transactions
            .iter()
            .map(|tx| tx.to_bytes())
            .collect::<Result<Vec<_>>>()?;

        merkle_root(&serialized).ok_or(Error::EmptyBlock)
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_zero()
    }

    /// Check the stored hash against the proof of work
    pub fn has_valid_pow(&self) -> Result<bool> {
        Ok(ProofOfWork::new(self)?.validate())
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "============ Block {} ============", self.hash)?;
        writeln!(f, "Height:    {}", self.height)?;
        writeln!(f, "Prev hash: {}", self.prev_hash)?;
        writeln!(f, "Timestamp: {}", self.timestamp)?;
        writeln!(f, "Nonce:     {}", self.nonce)?;
        for tx in &self.transactions {
            write!(f, "{}", tx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TxInput, TxOutput};

    fn coinbase(tag: &[u8]) -> Transaction {
        let mut tx = Transaction {
            id: Hash256::zero(),
            inputs: vec![TxInput::coinbase(tag.to_vec())],
            outputs: vec![TxOutput::new(100, vec![7; 20])],
            timestamp: 1_700_000_000,
            from_address: String::new(),
            to_address: String::new(),
            amount: 100,
            fee: 0,
        };
        tx.id = tx.hash().unwrap();
        tx
    }

    #[test]
    fn test_genesis_block() {
        let genesis = Block::genesis(coinbase(b"genesis")).unwrap();

        assert!(genesis.is_genesis());
        assert_eq!(genesis.height, 0);
        assert_eq!(genesis.transactions.len(), 1);
        assert!(genesis.transactions[0].is_coinbase());
        assert!(genesis.has_valid_pow().unwrap());
    }

    #[test]
    fn test_empty_block_rejected() {
        let result = Block::new(vec![], Hash256::zero(), 0);
        assert!(matches!(result, Err(Error::EmptyBlock)));
    }

    #[test]
    fn test_hash_transactions_commits_to_order() {
        let a = coinbase(b"a");
        let b = coinbase(b"b");

        let block = Block::new(vec![a.clone(), b.clone()], Hash256::new([1; 32]), 1).unwrap();
        let mut swapped = block.clone();
        swapped.transactions = vec![b, a];

        assert_ne!(
            block.hash_transactions().unwrap(),
            swapped.hash_transactions().unwrap()
        );
        assert!(!swapped.has_valid_pow().unwrap());
    }

    #[test]
    fn test_block_serialization() {
        let block = Block::new(vec![coinbase(b"ser")], Hash256::new([2; 32]), 5).unwrap();
        let decoded = Block::from_bytes(&block.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded, block);
        assert!(!decoded.is_genesis());
    }
}
