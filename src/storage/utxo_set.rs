// UTXO (Unspent Transaction Output) index

use crate::core::{Block, Hash256, Serializable, TxOutput};
use crate::error::{Error, Result};
use crate::storage::Blockchain;
use serde::{Deserialize, Serialize};
use sled::Tree;
use sled::transaction::{ConflictableTransactionError, TransactionResult};
use std::collections::{BTreeMap, HashMap};

/// Unspent output together with its position in the creating transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedOutput {
    pub index: u32,
    pub output: TxOutput,
}

impl IndexedOutput {
    pub fn new(index: u32, output: TxOutput) -> Self {
        Self { index, output }
    }
}

/// Stored value for one transaction id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub outputs: Vec<IndexedOutput>,
}

impl Serializable for UtxoEntry {}

impl UtxoEntry {
    /// Every output of a freshly created transaction
    pub fn from_outputs(outputs: &[TxOutput]) -> Self {
        Self {
            outputs: outputs
                .iter()
                .enumerate()
                .map(|(i, out)| IndexedOutput::new(i as u32, out.clone()))
                .collect(),
        }
    }

    /// Remove the output at `index`, returning whether it was present
    pub fn spend(&mut self, index: u32) -> bool {
        let before = self.outputs.len();
        self.outputs.retain(|o| o.index != index);
        self.outputs.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

/// Persisted index txid -> unspent outputs, derived from the ledger
pub struct UtxoSet {
    tree: Tree,
}

impl UtxoSet {
    const TREE_NAME: &'static str = "utxo";

    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(Self::TREE_NAME)?,
        })
    }

    /// Rebuild the whole index from the ledger in one atomic batch.
    /// Returns the number of transactions with unspent outputs.
    pub fn reindex(&self, blockchain: &Blockchain) -> Result<usize> {
        let utxos = blockchain.find_all_utxo()?;

        let mut batch = sled::Batch::default();
        for key in self.tree.iter().keys() {
            batch.remove(key?);
        }
        for (txid, entry) in &utxos {
            batch.insert(txid.as_bytes().as_slice(), entry.to_bytes()?);
        }
        self.tree.apply_batch(batch)?;

        log::info!("Reindexed UTXO set: {} transactions", utxos.len());
        Ok(utxos.len())
    }

    /// Apply one accepted block: spend its inputs, add its outputs.
    ///
    /// Runs as a single store transaction. An input whose referenced output
    /// is not in the index aborts the whole update with `Corrupted`.
    pub fn update(&self, block: &Block) -> Result<()> {
        let result: TransactionResult<(), Error> = self.tree.transaction(|tree| {
            for tx in &block.transactions {
                if !tx.is_coinbase() {
                    for input in &tx.inputs {
                        let key = input.txid.as_bytes().as_slice();
                        let spent = u32::try_from(input.output_index).ok();

                        let mut entry = match tree.get(key)? {
                            Some(bytes) => UtxoEntry::from_bytes(&bytes)
                                .map_err(ConflictableTransactionError::Abort)?,
                            None => UtxoEntry::default(),
                        };

                        if !spent.is_some_and(|index| entry.spend(index)) {
                            return Err(ConflictableTransactionError::Abort(Error::Corrupted(
                                format!(
                                    "block {} spends missing output {}:{}",
                                    block.hash, input.txid, input.output_index
                                ),
                            )));
                        }

                        if entry.is_empty() {
                            tree.remove(key)?;
                        } else {
                            let bytes = entry.to_bytes().map_err(ConflictableTransactionError::Abort)?;
                            tree.insert(key, bytes)?;
                        }
                    }
                }

                let entry = UtxoEntry::from_outputs(&tx.outputs);
                let bytes = entry.to_bytes().map_err(ConflictableTransactionError::Abort)?;
                tree.insert(tx.id.as_bytes().as_slice(), bytes)?;
            }
            Ok(())
        });

        result?;
        log::debug!("UTXO set updated with block {}", block.hash);
        Ok(())
    }

    /// Greedily collect outputs locked to `pub_key_hash` in key order until
    /// `amount` is covered. Returns the accumulated value and the chosen
    /// output indices per transaction.
    pub fn find_spendable(
        &self,
        pub_key_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, BTreeMap<Hash256, Vec<u32>>)> {
        let mut accumulated = 0u64;
        let mut selected: BTreeMap<Hash256, Vec<u32>> = BTreeMap::new();

        'entries: for item in self.tree.iter() {
            let (txid, entry) = decode_item(item)?;

            for indexed in entry.outputs {
                if accumulated >= amount {
                    break 'entries;
                }
                if indexed.output.is_locked_with_key(pub_key_hash) {
                    accumulated = accumulated.saturating_add(indexed.output.value);
                    selected.entry(txid).or_default().push(indexed.index);
                }
            }
        }

        Ok((accumulated, selected))
    }

    /// All unspent outputs locked to `pub_key_hash`
    pub fn find_utxo(&self, pub_key_hash: &[u8]) -> Result<Vec<TxOutput>> {
        let mut utxos = Vec::new();

        for item in self.tree.iter() {
            let (_, entry) = decode_item(item)?;
            utxos.extend(
                entry
                    .outputs
                    .into_iter()
                    .map(|indexed| indexed.output)
                    .filter(|out| out.is_locked_with_key(pub_key_hash)),
            );
        }

        Ok(utxos)
    }

    pub fn balance(&self, pub_key_hash: &[u8]) -> Result<u64> {
        Ok(self
            .find_utxo(pub_key_hash)?
            .iter()
            .map(|out| out.value)
            .sum())
    }

    pub fn is_unspent(&self, txid: &Hash256, index: u32) -> Result<bool> {
        Ok(self
            .get(txid)?
            .is_some_and(|entry| entry.outputs.iter().any(|o| o.index == index)))
    }

    pub fn get(&self, txid: &Hash256) -> Result<Option<UtxoEntry>> {
        self.tree
            .get(txid.as_bytes())?
            .map(|bytes| UtxoEntry::from_bytes(&bytes))
            .transpose()
    }

    /// Snapshot of the whole index
    pub fn entries(&self) -> Result<HashMap<Hash256, UtxoEntry>> {
        self.tree.iter().map(decode_item).collect()
    }

    pub fn count_transactions(&self) -> usize {
        self.tree.len()
    }
}

fn decode_item(item: sled::Result<(sled::IVec, sled::IVec)>) -> Result<(Hash256, UtxoEntry)> {
    let (key, value) = item?;
    let txid = Hash256::from_slice(&key)
        .ok_or_else(|| Error::Corrupted(format!("UTXO key of {} bytes", key.len())))?;
    Ok((txid, UtxoEntry::from_bytes(&value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Transaction, calc_fee};
    use crate::storage::Storage;
    use crate::wallet::{Wallet, new_transfer};

    fn ledger_for(wallet: &Wallet) -> Storage {
        let mut storage = Storage::memory().unwrap();
        storage.create_blockchain(&wallet.address()).unwrap();
        storage
    }

    #[test]
    fn test_entry_spend_keeps_indices() {
        let mut entry = UtxoEntry::from_outputs(&[
            TxOutput::new(1, vec![1]),
            TxOutput::new(2, vec![2]),
            TxOutput::new(3, vec![3]),
        ]);

        assert!(entry.spend(0));
        assert!(!entry.spend(0));
        assert_eq!(
            entry.outputs.iter().map(|o| o.index).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(entry.spend(2));
        assert_eq!(entry.outputs[0].output.value, 2);
    }

    #[test]
    fn test_genesis_balance() {
        let miner = Wallet::new();
        let storage = ledger_for(&miner);

        assert_eq!(storage.utxo_set.balance(&miner.pub_key_hash()).unwrap(), 100);
        assert_eq!(storage.utxo_set.count_transactions(), 1);
        assert_eq!(storage.utxo_set.balance(&Wallet::new().pub_key_hash()).unwrap(), 0);
    }

    #[test]
    fn test_find_spendable_stops_when_covered() {
        let miner = Wallet::new();
        let storage = ledger_for(&miner);

        let (accumulated, selected) = storage
            .utxo_set
            .find_spendable(&miner.pub_key_hash(), 30)
            .unwrap();
        assert_eq!(accumulated, 100);
        assert_eq!(selected.values().map(Vec::len).sum::<usize>(), 1);

        let (accumulated, selected) = storage
            .utxo_set
            .find_spendable(&Wallet::new().pub_key_hash(), 30)
            .unwrap();
        assert_eq!(accumulated, 0);
        assert!(selected.is_empty());
    }

    #[test]
    fn test_transfer_scenario() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let mut storage = ledger_for(&alice);

        let tx = new_transfer(&alice, &bob.address(), 10, &storage.utxo_set, &storage.blockchain)
            .unwrap();
        assert_eq!(tx.fee, calc_fee(10));
        storage.mine_block(vec![tx]).unwrap();

        let bob_outputs = storage.utxo_set.find_utxo(&bob.pub_key_hash()).unwrap();
        assert_eq!(bob_outputs.len(), 1);
        assert_eq!(bob_outputs[0].value, 10);
        assert_eq!(storage.utxo_set.balance(&alice.pub_key_hash()).unwrap(), 89);
    }

    #[test]
    fn test_update_matches_reindex() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let mut storage = ledger_for(&alice);

        for amount in [10, 20] {
            let tx = new_transfer(
                &alice,
                &bob.address(),
                amount,
                &storage.utxo_set,
                &storage.blockchain,
            )
            .unwrap();
            let coinbase = Transaction::new_coinbase(&alice.address(), "", Some(tx.fee)).unwrap();
            storage.mine_block(vec![coinbase, tx]).unwrap();
        }

        let incremental = storage.utxo_set.entries().unwrap();
        storage.utxo_set.reindex(&storage.blockchain).unwrap();
        assert_eq!(storage.utxo_set.entries().unwrap(), incremental);

        let brute_force = storage.blockchain.find_all_utxo().unwrap();
        assert_eq!(incremental, brute_force);
    }

    #[test]
    fn test_update_spending_missing_output_aborts() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let mut storage = ledger_for(&alice);

        let tx = new_transfer(&alice, &bob.address(), 10, &storage.utxo_set, &storage.blockchain)
            .unwrap();
        let block = storage.mine_block(vec![tx]).unwrap();
        let before = storage.utxo_set.entries().unwrap();

        // Replaying the block spends outputs that are already gone
        let result = storage.utxo_set.update(&block);
        assert!(matches!(result, Err(Error::Corrupted(_))));
        assert_eq!(storage.utxo_set.entries().unwrap(), before);
    }

    #[test]
    fn test_is_unspent() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let mut storage = ledger_for(&alice);
        let genesis_tx = storage.blockchain.find_block_by_height(0).unwrap().transactions[0].id;

        assert!(storage.utxo_set.is_unspent(&genesis_tx, 0).unwrap());
        assert!(!storage.utxo_set.is_unspent(&genesis_tx, 1).unwrap());

        let tx = new_transfer(&alice, &bob.address(), 5, &storage.utxo_set, &storage.blockchain)
            .unwrap();
        let spend_id = tx.id;
        storage.mine_block(vec![tx]).unwrap();

        assert!(!storage.utxo_set.is_unspent(&genesis_tx, 0).unwrap());
        assert!(storage.utxo_set.is_unspent(&spend_id, 0).unwrap());
        assert!(storage.utxo_set.is_unspent(&spend_id, 1).unwrap());
    }
}
