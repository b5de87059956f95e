//! Merkle Tree for Audit Anchors
//!
//! Implements Merkle tree construction, inclusion proofs and proof
//! verification over the ordered event hashes of an anchored range.
//!
//! Odd levels pair their last node with itself, so a tree over `n` leaves
//! always has `ceil(log2(n))` levels above the leaves.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::audit::hash::{hash_pair, ChainHash};

/// Side of the sibling relative to the running hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "L")]
    Left,
    #[serde(rename = "R")]
    Right,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => f.write_str("L"),
            Side::Right => f.write_str("R"),
        }
    }
}

/// One step of an inclusion proof
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: ChainHash,
    pub side: Side,
}

/// Merkle tree stored level by level: level 0 holds the leaves, the last
/// level holds the root.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<ChainHash>>,
}

impl MerkleTree {
    /// Build the tree bottom-up from the ordered leaf hashes
    pub fn from_leaves(leaves: Vec<ChainHash>) -> Self {
        if leaves.is_empty() {
            return Self { levels: vec![] };
        }

        let mut levels = vec![leaves];
        while let Some(current) = levels.last().filter(|level| level.len() > 1) {
            let next: Vec<ChainHash> = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => hash_pair(left, right),
                    [last] => hash_pair(last, last),
                    _ => unreachable!("chunks(2) yields one or two nodes"),
                })
                .collect();
            levels.push(next);
        }

        debug!(
            "Built Merkle tree: {} leaves, {} levels",
            levels[0].len(),
            levels.len()
        );
        Self { levels }
    }

    /// Root hash; the sentinel for an empty tree
    pub fn root(&self) -> ChainHash {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or(ChainHash::SENTINEL)
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    pub fn leaf(&self, index: usize) -> Option<ChainHash> {
        self.levels.first().and_then(|leaves| leaves.get(index)).copied()
    }

    /// Sibling path from leaf `index` up to (not including) the root
    pub fn proof(&self, index: usize) -> Option<Vec<ProofStep>> {
        if index >= self.leaf_count() {
            return None;
        }

        let mut path = Vec::with_capacity(self.levels.len().saturating_sub(1));
        let mut idx = index;

        for level in &self.levels[..self.levels.len() - 1] {
            let (sibling_idx, side) = if idx % 2 == 0 {
                (idx + 1, Side::Right)
            } else {
                (idx - 1, Side::Left)
            };
            // Odd level: the last node was paired with itself
            let sibling = level.get(sibling_idx).copied().unwrap_or(level[idx]);
            path.push(ProofStep { sibling, side });
            idx /= 2;
        }

        Some(path)
    }
}

/// Merkle root of the ordered leaf hashes
pub fn get_merkle_root(leaves: &[ChainHash]) -> ChainHash {
    MerkleTree::from_leaves(leaves.to_vec()).root()
}

/// Verify a claimed root against the leaves it should summarize
pub fn verify_merkle_root(leaves: &[ChainHash], claimed_root: &ChainHash) -> bool {
    get_merkle_root(leaves) == *claimed_root
}

/// Fold `leaf` up through `proof` and compare with `claimed_root`
pub fn verify_proof(leaf: &ChainHash, proof: &[ProofStep], claimed_root: &ChainHash) -> bool {
    let computed = proof.iter().fold(*leaf, |current, step| match step.side {
        Side::Left => hash_pair(&step.sibling, &current),
        Side::Right => hash_pair(&current, &step.sibling),
    });
    computed == *claimed_root
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::hash::sha256;

    fn leaves(count: usize) -> Vec<ChainHash> {
        (0..count).map(|i| sha256(format!("leaf-{}", i).as_bytes())).collect()
    }

    #[test]
    fn test_empty_root_is_sentinel() {
        assert_eq!(get_merkle_root(&[]), ChainHash::SENTINEL);
        assert_eq!(get_merkle_root(&[]).to_hex(), "0".repeat(64));
        assert!(MerkleTree::from_leaves(vec![]).proof(0).is_none());
    }

    #[test]
    fn test_single_leaf_is_root() {
        let l = leaves(1);
        let tree = MerkleTree::from_leaves(l.clone());
        assert_eq!(tree.root(), l[0]);
        assert!(tree.proof(0).unwrap().is_empty());
    }

    #[test]
    fn test_three_leaf_root_duplicates_last() {
        let l = leaves(3);
        let expected = hash_pair(&hash_pair(&l[0], &l[1]), &hash_pair(&l[2], &l[2]));
        assert_eq!(get_merkle_root(&l), expected);
    }

    #[test]
    fn test_five_leaf_root_duplicates_at_every_odd_level() {
        let l = leaves(5);
        // 5 -> 3 -> 2 -> 1
        let a = hash_pair(&l[0], &l[1]);
        let b = hash_pair(&l[2], &l[3]);
        let c = hash_pair(&l[4], &l[4]);
        let ab = hash_pair(&a, &b);
        let cc = hash_pair(&c, &c);
        let expected = hash_pair(&ab, &cc);
        assert_eq!(get_merkle_root(&l), expected);
    }

    #[test]
    fn test_proof_verifies_for_every_leaf() {
        for count in 1..=17 {
            let l = leaves(count);
            let tree = MerkleTree::from_leaves(l.clone());
            let root = get_merkle_root(&l);
            for (i, leaf) in l.iter().enumerate() {
                let proof = tree.proof(i).unwrap();
                assert!(
                    verify_proof(leaf, &proof, &root),
                    "leaf {} of {} failed",
                    i,
                    count
                );
            }
        }
    }

    #[test]
    fn test_proof_sides_follow_index_parity() {
        let l = leaves(5);
        let tree = MerkleTree::from_leaves(l.clone());
        let proof = tree.proof(2).unwrap();

        assert_eq!(proof.len(), 3);
        assert_eq!(proof[0], ProofStep { sibling: l[3], side: Side::Right });
        assert_eq!(proof[1].side, Side::Left);
        assert_eq!(proof[1].sibling, hash_pair(&l[0], &l[1]));
        assert_eq!(proof[2].side, Side::Right);

        // Last leaf of an odd level is its own sibling
        let last = tree.proof(4).unwrap();
        assert_eq!(last[0], ProofStep { sibling: l[4], side: Side::Right });
    }

    #[test]
    fn test_tampered_leaf_or_root_fails() {
        let l = leaves(8);
        let tree = MerkleTree::from_leaves(l.clone());
        let proof = tree.proof(3).unwrap();

        assert!(verify_proof(&l[3], &proof, &tree.root()));
        assert!(!verify_proof(&l[3].with_flipped_bit(7), &proof, &tree.root()));
        assert!(!verify_proof(&l[3], &proof, &tree.root().with_flipped_bit(0)));
        assert!(!verify_proof(&l[4], &proof, &tree.root()));
    }

    #[test]
    fn test_verify_merkle_root() {
        let l = leaves(6);
        let root = get_merkle_root(&l);
        assert!(verify_merkle_root(&l, &root));
        assert!(!verify_merkle_root(&l[..5], &root));
    }

    #[test]
    fn test_proof_out_of_range() {
        let tree = MerkleTree::from_leaves(leaves(4));
        assert!(tree.proof(4).is_none());
    }

    #[test]
    fn test_side_serializes_as_letter() {
        assert_eq!(serde_json::to_string(&Side::Left).unwrap(), "\"L\"");
        assert_eq!(serde_json::to_string(&Side::Right).unwrap(), "\"R\"");
    }
}
