//! Memory-backed database with an optional JSON snapshot

use super::{BlockIterator, Database, DbError, DbResult};
use crate::types::{Block, DkgPrivateKey, Hash, Round};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    blocks: Vec<Block>,
    compaction_chain_tip: Option<(Hash, u64)>,
    dkg_private_keys: BTreeMap<Round, DkgPrivateKey>,
}

/// In-memory [`Database`].
///
/// When opened with a path, the contents are loaded from that file if it
/// exists and written back on [`Database::close`].
pub struct MemBackedDb {
    /// Insertion order of blocks, used by iteration
    order: RwLock<Vec<Hash>>,
    blocks: RwLock<HashMap<Hash, Block>>,
    compaction_chain_tip: RwLock<Option<(Hash, u64)>>,
    dkg_private_keys: RwLock<BTreeMap<Round, DkgPrivateKey>>,
    persistent_path: Option<PathBuf>,
}

impl MemBackedDb {
    /// Create an empty database that is never persisted
    pub fn new() -> Self {
        Self::from_snapshot(Snapshot::default(), None)
    }

    /// Open a database backed by the JSON file at `path`
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = if path.exists() {
            let bytes = std::fs::read(&path)?;
            let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
            info!(
                path = %path.display(),
                blocks = snapshot.blocks.len(),
                dkg_keys = snapshot.dkg_private_keys.len(),
                "Loaded database snapshot"
            );
            snapshot
        } else {
            Snapshot::default()
        };
        Ok(Self::from_snapshot(snapshot, Some(path)))
    }

    fn from_snapshot(snapshot: Snapshot, persistent_path: Option<PathBuf>) -> Self {
        let order = snapshot.blocks.iter().map(|b| b.hash).collect();
        let blocks = snapshot.blocks.into_iter().map(|b| (b.hash, b)).collect();
        Self {
            order: RwLock::new(order),
            blocks: RwLock::new(blocks),
            compaction_chain_tip: RwLock::new(snapshot.compaction_chain_tip),
            dkg_private_keys: RwLock::new(snapshot.dkg_private_keys),
            persistent_path,
        }
    }

    /// Rounds with a stored DKG private key
    pub fn dkg_rounds(&self) -> Vec<Round> {
        self.dkg_private_keys.read().keys().copied().collect()
    }

    fn snapshot(&self) -> Snapshot {
        let blocks = self.blocks.read();
        Snapshot {
            blocks: self
                .order
                .read()
                .iter()
                .filter_map(|hash| blocks.get(hash).cloned())
                .collect(),
            compaction_chain_tip: *self.compaction_chain_tip.read(),
            dkg_private_keys: self.dkg_private_keys.read().clone(),
        }
    }
}

impl Default for MemBackedDb {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over a copy of the blocks taken when it was created
pub struct MemBlockIter {
    blocks: std::vec::IntoIter<Block>,
}

impl BlockIterator for MemBlockIter {
    fn next_block(&mut self) -> DbResult<Block> {
        self.blocks.next().ok_or(DbError::IterationFinished)
    }
}

impl Iterator for MemBlockIter {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        self.blocks.next()
    }
}

impl Database for MemBackedDb {
    fn has_block(&self, hash: &Hash) -> bool {
        self.blocks.read().contains_key(hash)
    }

    fn get_block(&self, hash: &Hash) -> DbResult<Block> {
        self.blocks
            .read()
            .get(hash)
            .cloned()
            .ok_or(DbError::BlockDoesNotExist(*hash))
    }

    fn get_all_blocks(&self) -> DbResult<Box<dyn BlockIterator>> {
        let blocks = self.snapshot().blocks;
        Ok(Box::new(MemBlockIter {
            blocks: blocks.into_iter(),
        }))
    }

    fn put_block(&self, block: Block) -> DbResult<()> {
        let mut blocks = self.blocks.write();
        if blocks.contains_key(&block.hash) {
            return Err(DbError::BlockExists(block.hash));
        }
        self.order.write().push(block.hash);
        blocks.insert(block.hash, block);
        Ok(())
    }

    fn put_compaction_chain_tip_info(&self, hash: Hash, height: u64) -> DbResult<()> {
        let mut tip = self.compaction_chain_tip.write();
        if let Some((_, current)) = *tip {
            if height <= current {
                return Err(DbError::InvalidCompactionChainTipHeight { current, height });
            }
        }
        *tip = Some((hash, height));
        Ok(())
    }

    fn get_compaction_chain_tip_info(&self) -> (Hash, u64) {
        self.compaction_chain_tip.read().unwrap_or_default()
    }

    fn has_dkg_private_key(&self, round: Round) -> DbResult<bool> {
        Ok(self.dkg_private_keys.read().contains_key(&round))
    }

    fn get_dkg_private_key(&self, round: Round) -> DbResult<DkgPrivateKey> {
        self.dkg_private_keys
            .read()
            .get(&round)
            .cloned()
            .ok_or(DbError::DkgPrivateKeyDoesNotExist(round))
    }

    fn put_dkg_private_key(&self, round: Round, key: &DkgPrivateKey) -> DbResult<()> {
        let mut keys = self.dkg_private_keys.write();
        if keys.contains_key(&round) {
            return Err(DbError::DkgPrivateKeyExists(round));
        }
        keys.insert(round, key.clone());
        debug!(round, "Stored DKG private key");
        Ok(())
    }

    fn close(&self) -> DbResult<()> {
        let Some(path) = &self.persistent_path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(&self.snapshot())?;
        std::fs::write(path, bytes)?;
        info!(path = %path.display(), "Saved database snapshot");
        Ok(())
    }
}
