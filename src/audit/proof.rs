//! Inclusion Proofs
//!
//! Produces Merkle inclusion proofs for anchored events. Trees are rebuilt
//! from stored leaves and kept in a small cache keyed by anchor id. Cached
//! trees are still compared with the anchor row on every use.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::anchor::Anchor;
use crate::audit::entry::TenantId;
use crate::audit::hash::ChainHash;
use crate::audit::merkle::{verify_proof, MerkleTree, ProofStep};
use crate::audit::verify::{Discrepancy, DiscrepancyKind};
use crate::error::{AuditError, AuditResult};
use crate::store::ChainStore;

/// Self-contained proof that an event hash is a leaf under an anchor root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    pub tenant_id: TenantId,
    pub sequence_number: u64,
    pub leaf_hash: ChainHash,
    /// Leaf to root, root excluded
    pub path: Vec<ProofStep>,
    pub root_hash: ChainHash,
    pub anchor_id: Uuid,
}

impl InclusionProof {
    pub fn verify(&self) -> bool {
        verify_proof(&self.leaf_hash, &self.path, &self.root_hash)
    }
}

/// Insertion-ordered cache with a fixed capacity
struct TreeCache {
    capacity: usize,
    trees: HashMap<Uuid, Arc<MerkleTree>>,
    order: VecDeque<Uuid>,
}

impl TreeCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            trees: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, anchor_id: &Uuid) -> Option<Arc<MerkleTree>> {
        self.trees.get(anchor_id).cloned()
    }

    fn insert(&mut self, anchor_id: Uuid, tree: Arc<MerkleTree>) {
        if self.capacity == 0 || self.trees.contains_key(&anchor_id) {
            return;
        }
        while self.trees.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.trees.remove(&oldest);
                }
                None => break,
            }
        }
        self.trees.insert(anchor_id, tree);
        self.order.push_back(anchor_id);
    }

    fn len(&self) -> usize {
        self.trees.len()
    }
}

#[derive(Clone)]
pub struct ProofGenerator {
    store: Arc<dyn ChainStore>,
    cache: Arc<Mutex<TreeCache>>,
}

impl ProofGenerator {
    pub fn new(store: Arc<dyn ChainStore>, cache_capacity: usize) -> Self {
        Self {
            store,
            cache: Arc::new(Mutex::new(TreeCache::new(cache_capacity))),
        }
    }

    /// Sibling path for the event at `sequence_number`
    pub async fn proof_steps(
        &self,
        tenant: &TenantId,
        sequence_number: u64,
    ) -> AuditResult<Vec<ProofStep>> {
        Ok(self.inclusion_proof(tenant, sequence_number).await?.path)
    }

    pub async fn inclusion_proof(
        &self,
        tenant: &TenantId,
        sequence_number: u64,
    ) -> AuditResult<InclusionProof> {
        let anchor = self
            .store
            .anchor_covering(tenant, sequence_number)
            .await?
            .ok_or_else(|| AuditError::NotAnchored {
                tenant_id: tenant.to_string(),
                sequence_number,
            })?;

        let tree = self.tree_for(&anchor).await?;
        let index = (sequence_number - anchor.start_seq) as usize;

        let (leaf_hash, path) = match (tree.leaf(index), tree.proof(index)) {
            (Some(leaf), Some(path)) => (leaf, path),
            _ => {
                return Err(AuditError::Storage(format!(
                    "Anchor {} has no leaf for sequence {}",
                    anchor.anchor_id, sequence_number
                )))
            }
        };

        debug!(
            "Proof for {}#{}: {} steps under anchor {}",
            tenant,
            sequence_number,
            path.len(),
            anchor.anchor_id
        );

        Ok(InclusionProof {
            tenant_id: tenant.clone(),
            sequence_number,
            leaf_hash,
            path,
            root_hash: anchor.root_hash,
            anchor_id: anchor.anchor_id,
        })
    }

    /// Cached tree, or one rebuilt from stored leaves. Either way the tree
    /// must match the anchor row as read now.
    async fn tree_for(&self, anchor: &Anchor) -> AuditResult<Arc<MerkleTree>> {
        let cached = self.cache.lock().await.get(&anchor.anchor_id);
        if let Some(tree) = cached {
            check_tree(anchor, &tree)?;
            return Ok(tree);
        }

        let leaves = self
            .store
            .leaf_hashes(&anchor.tenant_id, anchor.start_seq, anchor.end_seq)
            .await?;
        let tree = MerkleTree::from_leaves(leaves);
        check_tree(anchor, &tree)?;

        let tree = Arc::new(tree);
        self.cache.lock().await.insert(anchor.anchor_id, Arc::clone(&tree));
        Ok(tree)
    }

    pub async fn cached_trees(&self) -> usize {
        self.cache.lock().await.len()
    }
}

fn check_tree(anchor: &Anchor, tree: &MerkleTree) -> AuditResult<()> {
    let leaf_count = tree.leaf_count() as u64;
    if leaf_count == anchor.leaf_count && tree.root() == anchor.root_hash {
        return Ok(());
    }
    let discrepancy = Discrepancy {
        sequence_number: anchor.start_seq,
        kind: if leaf_count != anchor.leaf_count {
            DiscrepancyKind::LeafCountMismatch
        } else {
            DiscrepancyKind::RootMismatch
        },
        expected: anchor.root_hash.to_hex(),
        actual: tree.root().to_hex(),
        anchor_id: Some(anchor.anchor_id),
    };
    warn!("Refusing proof under anchor {}: {}", anchor.anchor_id, discrepancy);
    Err(AuditError::RootMismatch(discrepancy))
}
