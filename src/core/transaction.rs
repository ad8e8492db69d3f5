// Transaction data structures, signing and verification

use crate::core::{Hash256, Serializable, hash160, pub_key_hash_from_address, sha256};
use crate::error::{Error, Result};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey, ecdsa::Signature};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Output index carried by the single coinbase input
pub const COINBASE_OUTPUT_INDEX: i64 = -1;
/// Reward paid by the genesis coinbase
pub const REWARD_BASE: u64 = 100;
/// Sender label on coinbase transactions
pub const COINBASE_FROM: &str = "Base Reward";
/// Random bytes used when a coinbase has no data
const COINBASE_RANDOM_BYTES: usize = 20;

/// Unix time in seconds
pub fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Transaction fee for a transfer of `amount`.
///
/// | amount    | fee  |
/// |-----------|------|
/// | < 50      | 1    |
/// | 50..=200  | 10%  |
/// | 201..=500 | 20%  |
/// | > 500     | 30%  |
pub fn calc_fee(amount: u64) -> u64 {
    fn percent(amount: u64, pct: u128) -> u64 {
        (amount as u128 * pct / 100) as u64
    }

    match amount {
        0..=49 => 1,
        50..=200 => percent(amount, 10),
        201..=500 => percent(amount, 20),
        _ => percent(amount, 30),
    }
}

/// Coinbase reward: the base reward for genesis, otherwise 1.5x the fees
pub fn coinbase_reward(fee: Option<u64>) -> u64 {
    match fee {
        None => REWARD_BASE,
        Some(fee) => fee.saturating_mul(3) / 2,
    }
}

/// Transaction input - references a previous transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Id of the referenced transaction (zero for coinbase)
    pub txid: Hash256,
    /// Index of the output in the referenced transaction
    pub output_index: i64,
    /// r || s
    pub signature: Vec<u8>,
    /// x || y of the spender's key; arbitrary data for coinbase
    pub public_key: Vec<u8>,
}

impl TxInput {
    /// Create an unsigned input
    pub fn new(txid: Hash256, output_index: i64, public_key: Vec<u8>) -> Self {
        Self {
            txid,
            output_index,
            signature: Vec::new(),
            public_key,
        }
    }

    pub fn coinbase(data: Vec<u8>) -> Self {
        Self::new(Hash256::zero(), COINBASE_OUTPUT_INDEX, data)
    }

    pub fn is_coinbase(&self) -> bool {
        self.txid.is_zero() && self.output_index == COINBASE_OUTPUT_INDEX
    }

    /// Whether this input was signed by the owner of `pub_key_hash`
    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        hash160(&self.public_key).as_slice() == pub_key_hash
    }
}

/// Transaction output - a value locked to a public key hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub pub_key_hash: Vec<u8>,
}

impl TxOutput {
    pub fn new(value: u64, pub_key_hash: Vec<u8>) -> Self {
        Self {
            value,
            pub_key_hash,
        }
    }

    /// Create an output locked to an address
    pub fn locked_to(value: u64, address: &str) -> Result<Self> {
        Ok(Self::new(value, pub_key_hash_from_address(address)?))
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash == pub_key_hash
    }
}

/// Transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// SHA256 of the transaction serialized with this field zeroed
    pub id: Hash256,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub timestamp: i64,
    pub from_address: String,
    pub to_address: String,
    pub amount: u64,
    pub fee: u64,
}

impl Serializable for Transaction {}

impl Transaction {
    /// Create a coinbase transaction paying `to`.
    ///
    /// `fee` is `None` for the genesis coinbase. Empty `data` is replaced
    /// with random bytes so two coinbases for one miner never share an id.
    pub fn new_coinbase(to: &str, data: &str, fee: Option<u64>) -> Result<Self> {
        let data = if data.is_empty() {
            let random: [u8; COINBASE_RANDOM_BYTES] = rand::random();
            hex::encode(random)
        } else {
            data.to_string()
        };

        let reward = coinbase_reward(fee);
        log::debug!("Coinbase reward {} to {}", reward, to);

        let mut tx = Self {
            id: Hash256::zero(),
            inputs: vec![TxInput::coinbase(data.into_bytes())],
            outputs: vec![TxOutput::locked_to(reward, to)?],
            timestamp: now(),
            from_address: COINBASE_FROM.to_string(),
            to_address: to.to_string(),
            amount: reward,
            fee: 0,
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase()
    }

    /// Hash of the transaction with its id and signatures cleared.
    ///
    /// The id is assigned before signing, so signing leaves it valid.
    pub fn hash(&self) -> Result<Hash256> {
        let mut copy = self.clone();
        copy.id = Hash256::zero();
        for input in &mut copy.inputs {
            input.signature.clear();
        }
        Ok(sha256(&copy.to_bytes()?))
    }

    /// Sum of the output values, `None` on overflow
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |sum, out| sum.checked_add(out.value))
    }

    /// Check that the referenced outputs pay exactly for the outputs plus
    /// the declared fee. Coinbase transactions are exempt.
    pub fn check_balance(&self, prev_txs: &HashMap<Hash256, Transaction>) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }

        let invalid = |reason: String| Error::InvalidTransaction {
            id: self.id,
            reason,
        };

        let mut input_value = 0u64;
        for input in &self.inputs {
            let value = referenced_output(input, prev_txs)?.value;
            input_value = input_value
                .checked_add(value)
                .ok_or_else(|| invalid("input value overflows".to_owned()))?;
        }

        let spent = self
            .total_output_value()
            .and_then(|value| value.checked_add(self.fee))
            .ok_or_else(|| invalid("output value overflows".to_owned()))?;

        if input_value != spent {
            return Err(invalid(format!(
                "inputs hold {} but outputs plus fee take {}",
                input_value, spent
            )));
        }
        Ok(())
    }

    /// Copy used for signing: no signatures, keys, amount or fee
    pub fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .inputs
            .iter()
            .map(|input| TxInput::new(input.txid, input.output_index, Vec::new()))
            .collect();

        Transaction {
            id: self.id,
            inputs,
            outputs: self.outputs.clone(),
            timestamp: self.timestamp,
            from_address: self.from_address.clone(),
            to_address: self.to_address.clone(),
            amount: 0,
            fee: 0,
        }
    }

    /// Sign every input with `secret_key`.
    ///
    /// `prev_txs` must hold every transaction referenced by an input.
    pub fn sign(
        &mut self,
        secret_key: &SecretKey,
        prev_txs: &HashMap<Hash256, Transaction>,
    ) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }

        let secp = Secp256k1::signing_only();
        let mut trimmed = self.trimmed_copy();

        for index in 0..self.inputs.len() {
            let locking_hash = referenced_output(&self.inputs[index], prev_txs)?
                .pub_key_hash
                .clone();

            trimmed.inputs[index].public_key = locking_hash;
            let digest = trimmed.to_sighash()?;
            trimmed.inputs[index].public_key = Vec::new();

            let signature = secp.sign_ecdsa(&Message::from_digest(digest.0), secret_key);
            self.inputs[index].signature = signature.serialize_compact().to_vec();
        }

        Ok(())
    }

    /// Verify every input signature. Coinbase transactions are always valid.
    ///
    /// Returns `Ok(false)` for a bad signature; errors only when a referenced
    /// transaction is missing from `prev_txs`.
    pub fn verify(&self, prev_txs: &HashMap<Hash256, Transaction>) -> Result<bool> {
        if self.is_coinbase() {
            return Ok(true);
        }

        let secp = Secp256k1::verification_only();
        let mut trimmed = self.trimmed_copy();

        for (index, input) in self.inputs.iter().enumerate() {
            let prev_output = referenced_output(input, prev_txs)?;
            if !input.uses_key(&prev_output.pub_key_hash) {
                return Ok(false);
            }

            trimmed.inputs[index].public_key = prev_output.pub_key_hash.clone();
            let digest = trimmed.to_sighash()?;
            trimmed.inputs[index].public_key = Vec::new();

            let (Some(signature), Some(public_key)) = (
                parse_signature(&input.signature),
                parse_public_key(&input.public_key),
            ) else {
                return Ok(false);
            };

            if secp
                .verify_ecdsa(&Message::from_digest(digest.0), &signature, &public_key)
                .is_err()
            {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn to_sighash(&self) -> Result<Hash256> {
        Ok(sha256(&self.to_bytes()?))
    }
}

/// Output of a previous transaction referenced by `input`
fn referenced_output<'a>(
    input: &TxInput,
    prev_txs: &'a HashMap<Hash256, Transaction>,
) -> Result<&'a TxOutput> {
    let prev_tx = prev_txs
        .get(&input.txid)
        .ok_or(Error::TransactionNotFound(input.txid))?;

    usize::try_from(input.output_index)
        .ok()
        .and_then(|index| prev_tx.outputs.get(index))
        .ok_or_else(|| Error::InvalidTransaction {
            id: prev_tx.id,
            reason: format!("no output at index {}", input.output_index),
        })
}

/// Split `bytes` at the midpoint into two 32-byte big-endian halves
fn split_halves(bytes: &[u8]) -> Option<([u8; 32], [u8; 32])> {
    fn left_pad(half: &[u8]) -> Option<[u8; 32]> {
        if half.is_empty() || half.len() > 32 {
            return None;
        }
        let mut out = [0u8; 32];
        out[32 - half.len()..].copy_from_slice(half);
        Some(out)
    }

    let (first, second) = bytes.split_at(bytes.len() / 2);
    Some((left_pad(first)?, left_pad(second)?))
}

fn parse_signature(bytes: &[u8]) -> Option<Signature> {
    let (r, s) = split_halves(bytes)?;
    let mut compact = [0u8; 64];
    compact[..32].copy_from_slice(&r);
    compact[32..].copy_from_slice(&s);
    Signature::from_compact(&compact).ok()
}

fn parse_public_key(bytes: &[u8]) -> Option<PublicKey> {
    let (x, y) = split_halves(bytes)?;
    let mut uncompressed = [0u8; 65];
    uncompressed[0] = 0x04;
    uncompressed[1..33].copy_from_slice(&x);
    uncompressed[33..].copy_from_slice(&y);
    PublicKey::from_slice(&uncompressed).ok()
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "--- Transaction {}:", self.id)?;
        writeln!(f, "    Timestamp: {}", self.timestamp)?;
        writeln!(f, "    From:      {}", self.from_address)?;
        writeln!(f, "    To:        {}", self.to_address)?;
        writeln!(f, "    Amount:    {} (fee {})", self.amount, self.fee)?;
        for (i, input) in self.inputs.iter().enumerate() {
            writeln!(f, "    Input {}:", i)?;
            writeln!(f, "      TXID:      {}", input.txid)?;
            writeln!(f, "      Out:       {}", input.output_index)?;
            writeln!(f, "      Signature: {}", hex::encode(&input.signature))?;
            writeln!(f, "      PubKey:    {}", hex::encode(&input.public_key))?;
        }
        for (i, output) in self.outputs.iter().enumerate() {
            writeln!(f, "    Output {}:", i)?;
            writeln!(f, "      Value:  {}", output.value)?;
            writeln!(f, "      Script: {}", hex::encode(&output.pub_key_hash))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address_from_pub_key_hash;
    use rand::rngs::OsRng;

    struct TestKey {
        secret: SecretKey,
        public: Vec<u8>,
    }

    impl TestKey {
        fn generate() -> Self {
            let secp = Secp256k1::new();
            let secret = SecretKey::new(&mut OsRng);
            let public = secret.public_key(&secp).serialize_uncompressed()[1..].to_vec();
            Self { secret, public }
        }

        fn pub_key_hash(&self) -> Vec<u8> {
            hash160(&self.public).to_vec()
        }

        fn address(&self) -> String {
            address_from_pub_key_hash(&self.pub_key_hash())
        }
    }

    /// A funding coinbase for `owner` and a signed spend of its output
    fn signed_spend(owner: &TestKey) -> (Transaction, HashMap<Hash256, Transaction>) {
        let funding = Transaction::new_coinbase(&owner.address(), "funding", None).unwrap();
        let recipient = TestKey::generate();

        let mut tx = Transaction {
            id: Hash256::zero(),
            inputs: vec![TxInput::new(funding.id, 0, owner.public.clone())],
            outputs: vec![
                TxOutput::new(60, recipient.pub_key_hash()),
                TxOutput::new(34, owner.pub_key_hash()),
            ],
            timestamp: now(),
            from_address: owner.address(),
            to_address: recipient.address(),
            amount: 60,
            fee: calc_fee(60),
        };
        tx.id = tx.hash().unwrap();

        let mut prev_txs = HashMap::new();
        prev_txs.insert(funding.id, funding);
        tx.sign(&owner.secret, &prev_txs).unwrap();
        (tx, prev_txs)
    }

    #[test]
    fn test_fee_schedule() {
        assert_eq!(calc_fee(0), 1);
        assert_eq!(calc_fee(10), 1);
        assert_eq!(calc_fee(49), 1);
        assert_eq!(calc_fee(50), 5);
        assert_eq!(calc_fee(200), 20);
        assert_eq!(calc_fee(201), 40);
        assert_eq!(calc_fee(500), 100);
        assert_eq!(calc_fee(501), 150);
        assert_eq!(calc_fee(1000), 300);
    }

    #[test]
    fn test_fee_schedule_is_monotonic() {
        let mut last = 0;
        for amount in 0..2000 {
            let fee = calc_fee(amount);
            assert!(fee >= last, "fee dropped at {}", amount);
            last = fee;
        }
    }

    #[test]
    fn test_coinbase_transaction() {
        let key = TestKey::generate();
        let tx = Transaction::new_coinbase(&key.address(), "genesis", None).unwrap();

        assert!(tx.is_coinbase());
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.outputs[0].value, REWARD_BASE);
        assert!(tx.outputs[0].is_locked_with_key(&key.pub_key_hash()));
        assert_eq!(tx.inputs[0].public_key, b"genesis".to_vec());
        assert_eq!(tx.id, tx.hash().unwrap());
    }

    #[test]
    fn test_coinbase_reward_from_fees() {
        let key = TestKey::generate();
        let tx = Transaction::new_coinbase(&key.address(), "", Some(7)).unwrap();
        assert_eq!(tx.outputs[0].value, 10);
        assert_eq!(coinbase_reward(Some(0)), 0);
    }

    #[test]
    fn test_empty_coinbase_data_is_randomized() {
        let key = TestKey::generate();
        let a = Transaction::new_coinbase(&key.address(), "", Some(4)).unwrap();
        let b = Transaction::new_coinbase(&key.address(), "", Some(4)).unwrap();

        assert_eq!(a.inputs[0].public_key.len(), COINBASE_RANDOM_BYTES * 2);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_coinbase_rejects_bad_address() {
        let result = Transaction::new_coinbase("not-an-address", "x", None);
        assert!(matches!(result, Err(Error::InvalidAddress(_))));
    }

    #[test]
    fn test_id_ignores_id_field() {
        let key = TestKey::generate();
        let mut tx = Transaction::new_coinbase(&key.address(), "data", None).unwrap();
        let id = tx.id;
        tx.id = Hash256::new([9; 32]);
        assert_eq!(tx.hash().unwrap(), id);
    }

    #[test]
    fn test_sign_and_verify() {
        let owner = TestKey::generate();
        let (tx, prev_txs) = signed_spend(&owner);

        assert_eq!(tx.inputs[0].signature.len(), 64);
        assert!(tx.verify(&prev_txs).unwrap());
    }

    #[test]
    fn test_id_survives_signing() {
        let owner = TestKey::generate();
        let (tx, _) = signed_spend(&owner);

        assert!(!tx.inputs[0].signature.is_empty());
        assert_eq!(tx.hash().unwrap(), tx.id);
    }

    #[test]
    fn test_balance_check() {
        let owner = TestKey::generate();
        let (tx, prev_txs) = signed_spend(&owner);
        assert!(tx.check_balance(&prev_txs).is_ok());
        assert_eq!(tx.total_output_value(), Some(94));

        let mut inflated_fee = tx.clone();
        inflated_fee.fee = 1_000_000;
        assert!(matches!(
            inflated_fee.check_balance(&prev_txs),
            Err(Error::InvalidTransaction { .. })
        ));

        let mut overspent = tx.clone();
        overspent.outputs[0].value = 1_000_000;
        assert!(matches!(
            overspent.check_balance(&prev_txs),
            Err(Error::InvalidTransaction { .. })
        ));

        let mut overflowing = tx;
        overflowing.outputs[1].value = u64::MAX;
        assert_eq!(overflowing.total_output_value(), None);
        assert!(overflowing.check_balance(&prev_txs).is_err());
    }

    #[test]
    fn test_signature_bit_flip_fails() {
        let owner = TestKey::generate();
        let (tx, prev_txs) = signed_spend(&owner);

        for bit in [0usize, 7, 100, 255, 256, 300, 511] {
            let mut tampered = tx.clone();
            tampered.inputs[0].signature[bit / 8] ^= 1 << (bit % 8);
            assert!(!tampered.verify(&prev_txs).unwrap(), "bit {} accepted", bit);
        }
    }

    #[test]
    fn test_public_key_bit_flip_fails() {
        let owner = TestKey::generate();
        let (tx, prev_txs) = signed_spend(&owner);

        for bit in [0usize, 9, 255, 256, 400, 511] {
            let mut tampered = tx.clone();
            tampered.inputs[0].public_key[bit / 8] ^= 1 << (bit % 8);
            assert!(!tampered.verify(&prev_txs).unwrap(), "bit {} accepted", bit);
        }
    }

    #[test]
    fn test_modified_output_fails() {
        let owner = TestKey::generate();
        let (mut tx, prev_txs) = signed_spend(&owner);
        tx.outputs[0].value += 1;
        assert!(!tx.verify(&prev_txs).unwrap());
    }

    #[test]
    fn test_foreign_key_cannot_spend() {
        let owner = TestKey::generate();
        let thief = TestKey::generate();
        let (mut tx, prev_txs) = signed_spend(&owner);

        tx.inputs[0].public_key = thief.public.clone();
        tx.sign(&thief.secret, &prev_txs).unwrap();
        assert!(!tx.verify(&prev_txs).unwrap());
    }

    #[test]
    fn test_missing_previous_transaction() {
        let owner = TestKey::generate();
        let (tx, _) = signed_spend(&owner);

        let result = tx.verify(&HashMap::new());
        assert!(matches!(result, Err(Error::TransactionNotFound(id)) if id == tx.inputs[0].txid));
    }

    #[test]
    fn test_coinbase_verifies_without_history() {
        let key = TestKey::generate();
        let tx = Transaction::new_coinbase(&key.address(), "x", None).unwrap();
        assert!(tx.verify(&HashMap::new()).unwrap());
    }

    #[test]
    fn test_trimmed_copy_clears_secrets() {
        let owner = TestKey::generate();
        let (tx, _) = signed_spend(&owner);
        let trimmed = tx.trimmed_copy();

        assert_eq!(trimmed.id, tx.id);
        assert!(trimmed.inputs.iter().all(|i| i.signature.is_empty() && i.public_key.is_empty()));
        assert_eq!(trimmed.amount, 0);
        assert_eq!(trimmed.fee, 0);
        assert_eq!(trimmed.outputs, tx.outputs);
    }
}
