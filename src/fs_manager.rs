//! Local storage manager: tablet WAL directories, data block files, and the
//! metadata store locations.
//!
//! Blocks are plain files under `data/`, named by a freshly assigned random
//! id. Writable handles sync on close so a finalized artifact is durable
//! before its id is published anywhere.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{BootstrapError, IoResultExt, Result};
use crate::fetch::DownloadSink;

const WALS_DIR: &str = "wals";
const DATA_DIR: &str = "data";
const CONSENSUS_META_DIR: &str = "consensus-meta";
const TABLET_META_DIR: &str = "tablet-meta";

const MAX_BLOCK_ID_ATTEMPTS: u32 = 16;

/// Identifier assigned by the local block manager. Not portable across
/// servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u64);

impl BlockId {
    pub fn new(id: u64) -> Self {
        BlockId(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Root of the local on-disk tablet state.
pub struct FsManager {
    root: PathBuf,
    uuid: String,
}

impl FsManager {
    /// Opens (creating if necessary) the storage layout under `root`.
    pub fn open(root: impl Into<PathBuf>, uuid: impl Into<String>) -> Result<Self> {
        let root = root.into();
        for sub in [WALS_DIR, DATA_DIR, CONSENSUS_META_DIR, TABLET_META_DIR] {
            let dir = root.join(sub);
            std::fs::create_dir_all(&dir)
                .io_context(format!("unable to create {}", dir.display()))?;
        }
        Ok(FsManager {
            root,
            uuid: uuid.into(),
        })
    }

    /// Permanent uuid of this server.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tablet_wal_dir(&self, tablet_id: &str) -> PathBuf {
        self.root.join(WALS_DIR).join(tablet_id)
    }

    pub fn wal_segment_file_name(&self, tablet_id: &str, seqno: u64) -> PathBuf {
        self.tablet_wal_dir(tablet_id)
            .join(format!("wal-{:09}", seqno))
    }

    pub fn consensus_metadata_path(&self, tablet_id: &str) -> PathBuf {
        self.root.join(CONSENSUS_META_DIR).join(tablet_id)
    }

    pub fn tablet_metadata_path(&self, tablet_id: &str) -> PathBuf {
        self.root.join(TABLET_META_DIR).join(tablet_id)
    }

    pub fn block_path(&self, id: BlockId) -> PathBuf {
        self.root
            .join(DATA_DIR)
            .join(format!("{:016x}.data", id.id()))
    }

    /// Creates a new writable block with a freshly assigned local id.
    pub fn create_new_block(&self) -> Result<WritableBlock> {
        for _ in 0..MAX_BLOCK_ID_ATTEMPTS {
            let id = BlockId::new(rand::random::<u64>());
            if id.id() == 0 {
                continue;
            }
            let path = self.block_path(id);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    return Ok(WritableBlock {
                        id,
                        file,
                        data_dir: self.root.join(DATA_DIR),
                    })
                }
                // Id collision with an existing block; draw again.
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(BootstrapError::io(
                        format!("unable to create block file {}", path.display()),
                        e,
                    ))
                }
            }
        }
        Err(BootstrapError::IllegalState(
            "unable to assign an unused block id".to_string(),
        ))
    }

    /// fsyncs a directory so entry creation and deletion within it are
    /// durable.
    pub fn sync_dir(path: &Path) -> Result<()> {
        let dir =
            File::open(path).io_context(format!("unable to open dir {}", path.display()))?;
        dir.sync_all()
            .io_context(format!("unable to sync dir {}", path.display()))
    }
}

/// Writable handle for a newly created block. `close` makes the contents
/// durable and yields the assigned id.
pub struct WritableBlock {
    id: BlockId,
    file: File,
    data_dir: PathBuf,
}

impl WritableBlock {
    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn close(self) -> Result<BlockId> {
        self.file
            .sync_all()
            .io_context(format!("unable to sync block {}", self.id))?;
        FsManager::sync_dir(&self.data_dir)?;
        Ok(self.id)
    }
}

impl DownloadSink for WritableBlock {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.file
            .write_all(data)
            .io_context(format!("unable to append to block {}", self.id))
    }
}

/// Writable file that is fsynced when closed.
pub struct WalFileWriter {
    file: File,
    path: PathBuf,
}

impl WalFileWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .io_context(format!("unable to create {}", path.display()))?;
        Ok(WalFileWriter {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn close(self) -> Result<()> {
        self.file
            .sync_all()
            .io_context(format!("unable to sync {}", self.path.display()))
    }
}

impl DownloadSink for WalFileWriter {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.file
            .write_all(data)
            .io_context(format!("unable to append to {}", self.path.display()))
    }
}
