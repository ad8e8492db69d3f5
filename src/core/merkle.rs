// Merkle commitment over serialized transactions

use crate::core::{Hash256, sha256};

/// Merkle tree kept level by level, leaves first
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<Hash256>>,
}

impl MerkleTree {
    /// Build a tree from an ordered list of byte strings.
    /// Returns `None` for an empty list.
    pub fn new<T: AsRef<[u8]>>(data: &[T]) -> Option<Self> {
        if data.is_empty() {
            return None;
        }

        let mut leaves: Vec<Hash256> = data.iter().map(|d| sha256(d.as_ref())).collect();
        if leaves.len() % 2 != 0 {
            leaves.push(leaves[leaves.len() - 1]);
        }

        let mut levels = vec![leaves];
        while levels[levels.len() - 1].len() > 1 {
            let current = &levels[levels.len() - 1];
            let mut next_level = Vec::with_capacity(current.len().div_ceil(2));

            for chunk in current.chunks(2) {
                let left = chunk[0];
                // Odd node at an inner level pairs with itself
                let right = if chunk.len() == 2 { chunk[1] } else { chunk[0] };

                let mut combined = Vec::with_capacity(64);
                combined.extend_from_slice(left.as_bytes());
                combined.extend_from_slice(right.as_bytes());
                next_level.push(sha256(&combined));
            }

            levels.push(next_level);
        }

        Some(Self { levels })
    }

    pub fn root(&self) -> Hash256 {
        self.levels[self.levels.len() - 1][0]
    }

    /// Number of levels including leaves and root
    pub fn depth(&self) -> usize {
        self.levels.len()
    }
}

/// Root of the tree built over `data`, `None` when `data` is empty
pub fn merkle_root<T: AsRef<[u8]>>(data: &[T]) -> Option<Hash256> {
    MerkleTree::new(data).map(|tree| tree.root())
}
