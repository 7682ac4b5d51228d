//! Durable per-tablet metadata: the superblock store and the consensus
//! metadata record.
//!
//! Both records are protobuf encoded and replaced atomically: write to a
//! temporary file, fsync it, rename over the target, fsync the parent
//! directory. Crash recovery therefore sees either the old record or the new
//! one, never a torn write.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use prost::Message;

use crate::error::{BootstrapError, IoResultExt, Result};
use crate::fs_manager::FsManager;
use crate::pb;

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file =
            File::create(&tmp).io_context(format!("unable to create {}", tmp.display()))?;
        file.write_all(bytes)
            .io_context(format!("unable to write {}", tmp.display()))?;
        file.sync_all()
            .io_context(format!("unable to sync {}", tmp.display()))?;
    }
    std::fs::rename(&tmp, path).io_context(format!(
        "unable to rename {} over {}",
        tmp.display(),
        path.display()
    ))?;
    if let Some(parent) = path.parent() {
        FsManager::sync_dir(parent)?;
    }
    Ok(())
}

/// The tablet's root metadata record, backed by the local metadata store.
pub struct TabletMetadata {
    fs_manager: Arc<FsManager>,
    tablet_id: String,
    superblock: pb::TabletSuperBlock,
}

impl TabletMetadata {
    /// Persists a fresh metadata record in the COPYING state, the starting
    /// point of every bootstrap run.
    pub fn create_for_bootstrap(fs_manager: Arc<FsManager>, tablet_id: &str) -> Result<Self> {
        let superblock = pb::TabletSuperBlock {
            tablet_id: tablet_id.to_string(),
            state: pb::RemoteBootstrapState::Copying as i32,
            rowsets: Vec::new(),
            orphaned_blocks: Vec::new(),
        };
        let meta = TabletMetadata {
            fs_manager,
            tablet_id: tablet_id.to_string(),
            superblock,
        };
        meta.flush()?;
        Ok(meta)
    }

    pub fn load(fs_manager: Arc<FsManager>, tablet_id: &str) -> Result<Self> {
        let path = fs_manager.tablet_metadata_path(tablet_id);
        let bytes = std::fs::read(&path)
            .io_context(format!("unable to read tablet metadata {}", path.display()))?;
        let superblock = pb::TabletSuperBlock::decode(bytes.as_slice()).map_err(|e| {
            BootstrapError::Corruption(format!(
                "bad tablet metadata record for {}: {}",
                tablet_id, e
            ))
        })?;
        Ok(TabletMetadata {
            fs_manager,
            tablet_id: tablet_id.to_string(),
            superblock,
        })
    }

    pub fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    pub fn remote_bootstrap_state(&self) -> pb::RemoteBootstrapState {
        self.superblock.state()
    }

    pub fn superblock(&self) -> &pb::TabletSuperBlock {
        &self.superblock
    }

    /// Atomically replaces the live superblock. The single cutover point of
    /// a bootstrap run: once this returns, recovery sees a complete tablet.
    pub fn replace_superblock(&mut self, superblock: pb::TabletSuperBlock) -> Result<()> {
        self.superblock = superblock;
        self.flush()
    }

    fn flush(&self) -> Result<()> {
        let path = self.fs_manager.tablet_metadata_path(&self.tablet_id);
        write_atomic(&path, &self.superblock.encode_to_vec())
    }
}

/// Durable record of the committed Raft configuration and term under which
/// this replica rejoins its replication group.
pub struct ConsensusMetadata {
    peer_uuid: String,
    committed_config: pb::RaftConfig,
    current_term: u64,
}

impl ConsensusMetadata {
    /// Writes the consensus metadata record for `tablet_id`. Durable before
    /// return.
    pub fn create(
        fs_manager: &FsManager,
        tablet_id: &str,
        peer_uuid: &str,
        config: &pb::RaftConfig,
        current_term: u64,
    ) -> Result<Self> {
        let record = pb::ConsensusMetadataRecord {
            peer_uuid: peer_uuid.to_string(),
            committed_config: Some(config.clone()),
            current_term,
        };
        let path = fs_manager.consensus_metadata_path(tablet_id);
        write_atomic(&path, &record.encode_to_vec())?;
        Ok(ConsensusMetadata {
            peer_uuid: peer_uuid.to_string(),
            committed_config: config.clone(),
            current_term,
        })
    }

    pub fn load(fs_manager: &FsManager, tablet_id: &str) -> Result<Self> {
        let path = fs_manager.consensus_metadata_path(tablet_id);
        let bytes = std::fs::read(&path).io_context(format!(
            "unable to read consensus metadata {}",
            path.display()
        ))?;
        let record = pb::ConsensusMetadataRecord::decode(bytes.as_slice()).map_err(|e| {
            BootstrapError::Corruption(format!(
                "bad consensus metadata record for {}: {}",
                tablet_id, e
            ))
        })?;
        let committed_config = record.committed_config.ok_or_else(|| {
            BootstrapError::Corruption(format!(
                "consensus metadata record for {} has no committed config",
                tablet_id
            ))
        })?;
        Ok(ConsensusMetadata {
            peer_uuid: record.peer_uuid,
            committed_config,
            current_term: record.current_term,
        })
    }

    pub fn peer_uuid(&self) -> &str {
        &self.peer_uuid
    }

    pub fn committed_config(&self) -> &pb::RaftConfig {
        &self.committed_config
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }
}
