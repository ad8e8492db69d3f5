// Transaction builder

use crate::core::{Hash256, Transaction, TxInput, TxOutput, calc_fee, now, validate_address};
use crate::error::{Error, Result};
use crate::storage::{Blockchain, UtxoSet};
use crate::wallet::Wallet;

/// Build and sign a transfer of `amount` from `wallet` to `to`.
///
/// The fee from the fixed schedule is added on top of `amount`. Inputs are
/// picked from the UTXO index; any surplus returns to the sender as change.
pub fn new_transfer(
    wallet: &Wallet,
    to: &str,
    amount: u64,
    utxo_set: &UtxoSet,
    blockchain: &Blockchain,
) -> Result<Transaction> {
    if amount == 0 {
        return Err(Error::InvalidAmount(amount));
    }
    if !validate_address(to) {
        return Err(Error::InvalidAddress(to.to_string()));
    }

    let fee = calc_fee(amount);
    let total = amount
        .checked_add(fee)
        .ok_or(Error::InvalidAmount(amount))?;

    let sender_hash = wallet.pub_key_hash();
    let (accumulated, spendable) = utxo_set.find_spendable(&sender_hash, total)?;
    if accumulated < total {
        return Err(Error::InsufficientFunds {
            have: accumulated,
            need: total,
        });
    }

    let inputs = spendable
        .iter()
        .flat_map(|(txid, indices)| {
            indices
                .iter()
                .map(|&index| TxInput::new(*txid, i64::from(index), wallet.public_key().to_vec()))
        })
        .collect();

    let mut outputs = vec![TxOutput::locked_to(amount, to)?];
    let change = accumulated - total;
    if change > 0 {
        outputs.push(TxOutput::new(change, sender_hash));
    }

    let mut tx = Transaction {
        id: Hash256::zero(),
        inputs,
        outputs,
        timestamp: now(),
        from_address: wallet.address(),
        to_address: to.to_string(),
        amount,
        fee,
    };
    tx.id = tx.hash()?;
    blockchain.sign_transaction(&mut tx, wallet.secret_key())?;

    log::debug!("Built transaction {} ({} -> {}, {})", tx.id, tx.from_address, to, amount);
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn funded(wallet: &Wallet) -> Storage {
        let mut storage = Storage::memory().unwrap();
        storage.create_blockchain(&wallet.address()).unwrap();
        storage
    }

    #[test]
    fn test_transfer_with_change() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let storage = funded(&alice);

        let tx = new_transfer(&alice, &bob.address(), 60, &storage.utxo_set, &storage.blockchain)
            .unwrap();

        assert_eq!(tx.fee, 6);
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.outputs.len(), 2);
        assert!(tx.outputs[0].is_locked_with_key(&bob.pub_key_hash()));
        assert_eq!(tx.outputs[0].value, 60);
        assert_eq!(tx.outputs[1].value, 34);
        assert!(storage.blockchain.verify_transaction(&tx).unwrap());
    }

    #[test]
    fn test_exact_spend_has_no_change() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let storage = funded(&alice);

        // 91 + 9 fee uses the whole genesis output
        let tx = new_transfer(&alice, &bob.address(), 91, &storage.utxo_set, &storage.blockchain)
            .unwrap();
        assert_eq!(tx.fee, 9);
        assert_eq!(tx.outputs.len(), 1);
    }

    #[test]
    fn test_insufficient_funds() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let storage = funded(&alice);

        let result = new_transfer(&alice, &bob.address(), 95, &storage.utxo_set, &storage.blockchain);
        assert!(matches!(
            result,
            Err(Error::InsufficientFunds { have: 100, need: 104 })
        ));

        let result = new_transfer(&bob, &alice.address(), 1, &storage.utxo_set, &storage.blockchain);
        assert!(matches!(result, Err(Error::InsufficientFunds { have: 0, need: 2 })));
    }

    #[test]
    fn test_rejects_bad_input() {
        let alice = Wallet::new();
        let storage = funded(&alice);

        let result = new_transfer(&alice, "nope", 5, &storage.utxo_set, &storage.blockchain);
        assert!(matches!(result, Err(Error::InvalidAddress(_))));

        let result = new_transfer(
            &alice,
            &Wallet::new().address(),
            0,
            &storage.utxo_set,
            &storage.blockchain,
        );
        assert!(matches!(result, Err(Error::InvalidAmount(0))));
    }
}
