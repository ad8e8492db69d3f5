// Proof of Work implementation

use crate::core::{Block, Hash256, sha256};
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Required leading zero bits of every block hash
pub const TARGET_BITS: u32 = 16;

/// How many nonces are tried between cancellation checks
const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// Difficulty target: hashes must be strictly below 2^(256 - bits)
#[derive(Debug, Clone, Copy)]
pub struct Target {
    pub bits: u32,
    target_hash: Hash256,
}

impl Target {
    /// Build the target for `bits` leading zero bits (clamped to 1..=255)
    pub fn from_bits(bits: u32) -> Self {
        debug_assert!((1..=255).contains(&bits), "difficulty out of range: {}", bits);
        let bits = bits.clamp(1, 255);

        // Set bit (256 - bits) counting from the least significant end
        let position = (256 - bits) as usize;
        let mut target = [0u8; 32];
        target[31 - position / 8] = 1 << (position % 8);

        Self {
            bits,
            target_hash: Hash256::new(target),
        }
    }

    pub fn to_hash256(&self) -> Hash256 {
        self.target_hash
    }

    /// Check if a hash meets this target (hash < target, big-endian)
    #[inline]
    pub fn is_valid_hash(&self, hash: &Hash256) -> bool {
        hash.as_bytes() < self.target_hash.as_bytes()
    }
}

impl Default for Target {
    fn default() -> Self {
        Self::from_bits(TARGET_BITS)
    }
}

/// Nonce search over a block's header material
pub struct ProofOfWork<'a> {
    block: &'a Block,
    merkle_root: Hash256,
    target: Target,
}

impl<'a> ProofOfWork<'a> {
    pub fn new(block: &'a Block) -> Result<Self> {
        Self::with_target(block, Target::default())
    }

    pub fn with_target(block: &'a Block, target: Target) -> Result<Self> {
        Ok(Self {
            block,
            merkle_root: block.hash_transactions()?,
            target,
        })
    }

    /// prev_hash || merkle_root || timestamp || bits || nonce, integers big-endian
    pub fn prepare_data(&self, nonce: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(32 + 32 + 8 + 8 + 8);
        data.extend_from_slice(self.block.prev_hash.as_bytes());
        data.extend_from_slice(self.merkle_root.as_bytes());
        data.extend_from_slice(&self.block.timestamp.to_be_bytes());
        data.extend_from_slice(&(self.target.bits as i64).to_be_bytes());
        data.extend_from_slice(&nonce.to_be_bytes());
        data
    }

    /// Search nonces from zero until a hash falls below the target.
    ///
    /// Setting `cancel` aborts the search with `MiningCancelled`.
    pub fn run(&self, cancel: &AtomicBool) -> Result<MiningResult> {
        let start_time = Instant::now();
        let mut nonce = 0u64;

        loop {
            let hash = sha256(&self.prepare_data(nonce));

            if self.target.is_valid_hash(&hash) {
                return Ok(MiningResult {
                    nonce,
                    hash,
                    attempts: nonce + 1,
                    duration: start_time.elapsed(),
                });
            }

            if nonce % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
                log::info!("Mining of block {} cancelled after {} attempts", self.block.height, nonce);
                return Err(Error::MiningCancelled);
            }

            // Progress indicator every 100k attempts
            if nonce > 0 && nonce % 100_000 == 0 {
                let elapsed = start_time.elapsed();
                log::debug!(
                    "Mining attempts: {} ({:.1} KH/s)",
                    nonce,
                    nonce as f64 / elapsed.as_secs_f64() / 1000.0
                );
            }

            nonce = nonce.checked_add(1).ok_or(Error::MiningExhausted)?;
        }
    }

    /// Recompute the block hash from its nonce and check it against the target
    pub fn validate(&self) -> bool {
        let hash = sha256(&self.prepare_data(self.block.nonce));
        hash == self.block.hash && self.target.is_valid_hash(&hash)
    }
}

/// Mining result
#[derive(Debug)]
pub struct MiningResult {
    pub nonce: u64,
    pub hash: Hash256,
    pub attempts: u64,
    pub duration: Duration,
}

impl MiningResult {
    /// Hashes per second
    pub fn hash_rate(&self) -> f64 {
        self.attempts as f64 / self.duration.as_secs_f64().max(f64::EPSILON)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Transaction, TxInput, TxOutput};

    fn sample_block() -> Block {
        let tx = Transaction {
            id: Hash256::new([3; 32]),
            inputs: vec![TxInput::coinbase(b"pow".to_vec())],
            outputs: vec![TxOutput::new(100, vec![1; 20])],
            timestamp: 1_700_000_000,
            from_address: String::new(),
            to_address: String::new(),
            amount: 100,
            fee: 0,
        };
        Block {
            timestamp: 1_700_000_000,
            transactions: vec![tx],
            prev_hash: Hash256::zero(),
            hash: Hash256::zero(),
            nonce: 0,
            height: 0,
        }
    }

    #[test]
    fn test_target_for_default_difficulty() {
        let target = Target::default();
        let mut expected = [0u8; 32];
        expected[1] = 0x01;
        assert_eq!(target.to_hash256(), Hash256::new(expected));
        assert_eq!(target.bits, TARGET_BITS);
    }

    #[test]
    fn test_target_validation() {
        let target = Target::from_bits(16);

        assert!(target.is_valid_hash(&Hash256::zero()));
        assert!(!target.is_valid_hash(&Hash256::new([0xff; 32])));

        let mut just_below = [0xffu8; 32];
        just_below[0] = 0;
        just_below[1] = 0;
        assert!(target.is_valid_hash(&Hash256::new(just_below)));

        // Equal to the target is not below it
        assert!(!target.is_valid_hash(&target.to_hash256()));
    }

    #[test]
    fn test_prepare_data_layout() {
        let block = sample_block();
        let pow = ProofOfWork::new(&block).unwrap();
        let data = pow.prepare_data(0x0102);

        assert_eq!(data.len(), 88);
        assert_eq!(&data[..32], block.prev_hash.as_bytes());
        assert_eq!(&data[32..64], block.hash_transactions().unwrap().as_bytes());
        assert_eq!(&data[64..72], &1_700_000_000i64.to_be_bytes());
        assert_eq!(&data[72..80], &16i64.to_be_bytes());
        assert_eq!(&data[80..], &[0, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_mined_block_validates() {
        let mut block = sample_block();
        let result = ProofOfWork::new(&block)
            .unwrap()
            .run(&AtomicBool::new(false))
            .unwrap();

        block.nonce = result.nonce;
        block.hash = result.hash;
        assert!(ProofOfWork::new(&block).unwrap().validate());
        assert!(result.attempts > 0);
    }

    #[test]
    fn test_tampered_block_fails_validation() {
        let mut block = sample_block();
        let result = ProofOfWork::new(&block)
            .unwrap()
            .run(&AtomicBool::new(false))
            .unwrap();
        block.nonce = result.nonce;
        block.hash = result.hash;

        let mut other_nonce = block.clone();
        other_nonce.nonce += 1;
        assert!(!ProofOfWork::new(&other_nonce).unwrap().validate());

        let mut other_time = block.clone();
        other_time.timestamp += 1;
        assert!(!ProofOfWork::new(&other_time).unwrap().validate());
    }

    #[test]
    fn test_cancelled_search() {
        let block = sample_block();
        let pow = ProofOfWork::with_target(&block, Target::from_bits(255)).unwrap();

        let result = pow.run(&AtomicBool::new(true));
        assert!(matches!(result, Err(Error::MiningCancelled)));
    }
}
