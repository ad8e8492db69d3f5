// Consensus rules

pub mod pow;

pub use pow::{MiningResult, ProofOfWork, TARGET_BITS, Target};
