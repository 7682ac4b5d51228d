//! Session coordinator for remote bootstrap.
//!
//! Drives one bootstrap run end to end: begin a session with the leader,
//! download the durable log segments, download every data block while
//! rewriting the superblock's references to freshly assigned local ids,
//! persist the consensus metadata, atomically swap in the new superblock,
//! then release the remote session.
//!
//! A client instance performs exactly one run; `run_remote_bootstrap`
//! consumes it. Any failure before the superblock swap leaves the tablet in
//! the COPYING state, where a later run can clean up and retry.

use std::sync::Arc;
use std::time::Duration;

use crate::config::BootstrapConfig;
use crate::error::{BootstrapError, Result, ResultExt};
use crate::fetch::{DownloadSink, FileDownloader};
use crate::fs_manager::{BlockId, FsManager, WalFileWriter};
use crate::metadata::{ConsensusMetadata, TabletMetadata};
use crate::peer;
use crate::proxy::{BootstrapTransport, Messenger};
use crate::{metrics, pb};

/// Receiver for human-readable progress updates.
pub trait StatusListener: Send + Sync {
    fn status_message(&self, message: &str);
}

/// Listener that logs progress at info level.
pub struct LogStatusListener;

impl StatusListener for LogStatusListener {
    fn status_message(&self, message: &str) {
        log::info!("{}", message);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NoSession,
    SessionStarted,
}

struct SessionData {
    session_id: String,
    idle_timeout: Duration,
    superblock: pb::TabletSuperBlock,
    wal_seqnos: Vec<u64>,
    committed_cstate: pb::ConsensusState,
}

/// Client-side driver of one remote bootstrap run.
pub struct RemoteBootstrapClient {
    fs_manager: Arc<FsManager>,
    messenger: Arc<dyn Messenger>,
    permanent_uuid: String,
    config: BootstrapConfig,
    state: State,
    tablet_id: String,
    transport: Option<Box<dyn BootstrapTransport>>,
    session: Option<SessionData>,
    new_superblock: Option<pb::TabletSuperBlock>,
}

impl RemoteBootstrapClient {
    pub fn new(
        fs_manager: Arc<FsManager>,
        messenger: Arc<dyn Messenger>,
        permanent_uuid: impl Into<String>,
        config: BootstrapConfig,
    ) -> Self {
        RemoteBootstrapClient {
            fs_manager,
            messenger,
            permanent_uuid: permanent_uuid.into(),
            config,
            state: State::NoSession,
            tablet_id: String::new(),
            transport: None,
            session: None,
            new_superblock: None,
        }
    }

    /// Performs one bootstrap of `meta`'s tablet from the leader named by
    /// `cstate`, consuming the client.
    pub async fn run_remote_bootstrap(
        mut self,
        meta: &mut TabletMetadata,
        cstate: &pb::ConsensusState,
        listener: &dyn StatusListener,
    ) -> Result<()> {
        if meta.remote_bootstrap_state() != pb::RemoteBootstrapState::Copying {
            return Err(BootstrapError::IllegalState(format!(
                "tablet {} must be in the COPYING state to bootstrap, but is {:?}",
                meta.tablet_id(),
                meta.remote_bootstrap_state()
            )));
        }
        let tablet_id = meta.tablet_id().to_string();

        self.begin_remote_bootstrap_session(&tablet_id, cstate, listener)
            .await?;
        self.download_wals(listener).await?;
        self.download_blocks(listener).await?;

        self.update_status(listener, "Writing consensus metadata");
        self.write_consensus_metadata()
            .context("Unable to write consensus metadata")?;

        log::info!(
            "Tablet {} remote bootstrap complete. Replacing superblock.",
            tablet_id
        );
        self.update_status(listener, "Replacing tablet superblock");
        let new_superblock = self.new_superblock.take().ok_or_else(|| {
            BootstrapError::IllegalState("no superblock staged for install".to_string())
        })?;
        meta.replace_superblock(new_superblock)?;

        // Releases anchors on the remote. The local replica is already
        // durable, so a failure here is not fatal.
        if let Err(e) = self.end_remote_bootstrap_session(listener).await {
            log::warn!(
                "Error ending remote bootstrap session for tablet {}: {}",
                tablet_id,
                e
            );
        }
        Ok(())
    }

    async fn begin_remote_bootstrap_session(
        &mut self,
        tablet_id: &str,
        cstate: &pb::ConsensusState,
        listener: &dyn StatusListener,
    ) -> Result<()> {
        if self.state != State::NoSession {
            return Err(BootstrapError::IllegalState(
                "remote bootstrap session already started".to_string(),
            ));
        }
        self.tablet_id = tablet_id.to_string();
        self.update_status(listener, "Initializing remote bootstrap");

        let leader = peer::extract_leader_from_config(cstate).context(format!(
            "Cannot find leader tablet in config to remotely bootstrap from: {:?}",
            cstate
        ))?;
        let addr = peer::resolve_leader_addr(leader, self.config.begin_session_timeout()).await?;
        log::info!(
            "Beginning remote bootstrap session on tablet {} from leader {}",
            tablet_id,
            addr
        );
        self.update_status(
            listener,
            &format!("Beginning remote bootstrap session with leader {}", addr),
        );

        let mut transport = self
            .messenger
            .connect(addr, self.config.begin_session_timeout())
            .await
            .context("Unable to begin remote bootstrap session")?;

        let req = pb::BeginSessionRequest {
            requestor_uuid: self.permanent_uuid.clone(),
            tablet_id: tablet_id.to_string(),
        };
        let resp = transport
            .begin_session(req, self.config.begin_session_timeout())
            .await
            .context("Unable to begin remote bootstrap session")?;
        metrics::SESSIONS_STARTED_COUNTER.inc();

        let superblock = resp.superblock.ok_or_else(|| {
            BootstrapError::InvalidArgument(
                "begin session response is missing the tablet superblock".to_string(),
            )
        })?;
        // Only a fully materialized remote replica can serve as a source.
        if superblock.state() != pb::RemoteBootstrapState::Done {
            let e = BootstrapError::IllegalState(format!(
                "Leader of config ({:?}) is currently remotely bootstrapping itself: \
                 superblock state is {:?}",
                cstate,
                superblock.state()
            ));
            log::warn!("{}", e);
            return Err(e);
        }
        let committed_cstate = resp.initial_committed_cstate.ok_or_else(|| {
            BootstrapError::InvalidArgument(
                "begin session response is missing the committed consensus state".to_string(),
            )
        })?;

        self.session = Some(SessionData {
            session_id: resp.session_id,
            idle_timeout: Duration::from_millis(resp.session_idle_timeout_millis),
            superblock,
            wal_seqnos: resp.wal_segment_seqnos,
            committed_cstate,
        });
        self.transport = Some(transport);
        self.state = State::SessionStarted;
        Ok(())
    }

    async fn download_wals(&mut self, listener: &dyn StatusListener) -> Result<()> {
        self.check_session_started()?;

        // Delete and recreate the WAL dir so stray files from previous
        // bootstrap attempts do not survive into the new replica.
        let wal_dir = self.fs_manager.tablet_wal_dir(&self.tablet_id);
        if wal_dir.exists() {
            std::fs::remove_dir_all(&wal_dir)
                .map_err(|e| BootstrapError::io(format!("unable to delete {}", wal_dir.display()), e))?;
        }
        std::fs::create_dir(&wal_dir)
            .map_err(|e| BootstrapError::io(format!("unable to create {}", wal_dir.display()), e))?;
        if let Some(parent) = wal_dir.parent() {
            // fsync the parent dir so the recreated dir entry is durable.
            FsManager::sync_dir(parent)?;
        }

        let wal_seqnos = self.session()?.wal_seqnos.clone();
        let num_segments = wal_seqnos.len();
        log::info!("Starting download of {} WAL segments...", num_segments);
        for (counter, seqno) in wal_seqnos.into_iter().enumerate() {
            self.update_status(
                listener,
                &format!(
                    "Downloading WAL segment with seq. number {} ({}/{})",
                    seqno,
                    counter + 1,
                    num_segments
                ),
            );
            self.download_wal(seqno).await.context(format!(
                "Unable to download WAL segment with seq. number {}",
                seqno
            ))?;
        }
        Ok(())
    }

    async fn download_wal(&mut self, seqno: u64) -> Result<()> {
        log::debug!("Downloading WAL segment with seqno {}", seqno);
        let data_id = pb::DataId {
            kind: pb::DataType::LogSegment as i32,
            block_id: None,
            wal_segment_seqno: seqno,
        };
        let dest_path = self.fs_manager.wal_segment_file_name(&self.tablet_id, seqno);
        let mut writer =
            WalFileWriter::create(&dest_path).context("Unable to open file for writing")?;
        self.download_file(&data_id, &mut writer).await?;
        writer.close()
    }

    async fn download_blocks(&mut self, listener: &dyn StatusListener) -> Result<()> {
        self.check_session_started()?;

        // Work on a deep copy; the received snapshot stays untouched until
        // every reference in the copy points at a local block.
        let mut new_sb = self.session()?.superblock.clone();
        let num_blocks = count_block_refs(&new_sb);
        let mut block_count = 0usize;

        log::info!("Starting download of {} data blocks...", num_blocks);
        for rowset in new_sb.rowsets.iter_mut() {
            for col in rowset.columns.iter_mut() {
                self.download_and_rewrite_block(&mut col.block, &mut block_count, num_blocks, listener)
                    .await?;
            }
            for redo in rowset.redo_deltas.iter_mut() {
                self.download_and_rewrite_block(&mut redo.block, &mut block_count, num_blocks, listener)
                    .await?;
            }
            for undo in rowset.undo_deltas.iter_mut() {
                self.download_and_rewrite_block(&mut undo.block, &mut block_count, num_blocks, listener)
                    .await?;
            }
            if rowset.bloom_block.is_some() {
                self.download_and_rewrite_block(
                    &mut rowset.bloom_block,
                    &mut block_count,
                    num_blocks,
                    listener,
                )
                .await?;
            }
            if rowset.adhoc_index_block.is_some() {
                self.download_and_rewrite_block(
                    &mut rowset.adhoc_index_block,
                    &mut block_count,
                    num_blocks,
                    listener,
                )
                .await?;
            }
        }

        // Orphaned block ids only name physical blocks on the remote.
        new_sb.orphaned_blocks.clear();

        self.new_superblock = Some(new_sb);
        Ok(())
    }

    async fn download_and_rewrite_block(
        &mut self,
        block_ref: &mut Option<pb::BlockId>,
        block_count: &mut usize,
        num_blocks: usize,
        listener: &dyn StatusListener,
    ) -> Result<()> {
        let old_block_id = block_ref
            .as_ref()
            .map(|b| BlockId::new(b.id))
            .ok_or_else(|| {
                BootstrapError::InvalidArgument(
                    "rowset references a block with no id".to_string(),
                )
            })?;
        *block_count += 1;
        self.update_status(
            listener,
            &format!(
                "Downloading block {} ({}/{})",
                old_block_id, *block_count, num_blocks
            ),
        );

        let new_block_id = self
            .download_block(old_block_id)
            .await
            .context(format!("Unable to download block with id {}", old_block_id))?;
        *block_ref = Some(pb::BlockId {
            id: new_block_id.id(),
        });
        Ok(())
    }

    async fn download_block(&mut self, old_block_id: BlockId) -> Result<BlockId> {
        log::debug!("Downloading block with block id {}", old_block_id);
        let mut block = self
            .fs_manager
            .create_new_block()
            .context("Unable to create new block")?;
        let data_id = pb::DataId {
            kind: pb::DataType::Block as i32,
            block_id: Some(pb::BlockId {
                id: old_block_id.id(),
            }),
            wal_segment_seqno: 0,
        };
        self.download_file(&data_id, &mut block)
            .await
            .context(format!("Unable to download block {}", old_block_id))?;
        block.close()
    }

    async fn download_file(
        &mut self,
        data_id: &pb::DataId,
        sink: &mut dyn DownloadSink,
    ) -> Result<()> {
        let session = match self.session.as_ref() {
            Some(session) => session,
            None => {
                return Err(BootstrapError::IllegalState(
                    "remote bootstrap session not started".to_string(),
                ))
            }
        };
        let transport = match self.transport.as_mut() {
            Some(transport) => transport,
            None => {
                return Err(BootstrapError::IllegalState(
                    "no transport for the remote bootstrap session".to_string(),
                ))
            }
        };
        let mut downloader = FileDownloader::new(
            &mut **transport,
            &session.session_id,
            session.idle_timeout,
            self.config.max_transfer_length(),
        );
        downloader.download(data_id, sink).await
    }

    fn write_consensus_metadata(&self) -> Result<()> {
        let session = self.session()?;
        let config = session.committed_cstate.config.as_ref().ok_or_else(|| {
            BootstrapError::InvalidArgument(
                "committed consensus state is missing its config".to_string(),
            )
        })?;
        ConsensusMetadata::create(
            &self.fs_manager,
            &self.tablet_id,
            self.fs_manager.uuid(),
            config,
            session.committed_cstate.current_term,
        )?;
        Ok(())
    }

    async fn end_remote_bootstrap_session(
        &mut self,
        listener: &dyn StatusListener,
    ) -> Result<()> {
        self.check_session_started()?;
        self.update_status(listener, "Ending remote bootstrap session");

        let session_id = self.session()?.session_id.clone();
        let timeout = self.config.begin_session_timeout();
        let transport = match self.transport.as_mut() {
            Some(transport) => transport,
            None => {
                return Err(BootstrapError::IllegalState(
                    "no transport for the remote bootstrap session".to_string(),
                ))
            }
        };
        let req = pb::EndSessionRequest {
            session_id,
            is_success: true,
        };
        transport
            .end_session(req, timeout)
            .await
            .context("Failure ending remote bootstrap session")?;

        self.update_status(listener, "Remote bootstrap complete");
        Ok(())
    }

    fn session(&self) -> Result<&SessionData> {
        self.session.as_ref().ok_or_else(|| {
            BootstrapError::IllegalState("remote bootstrap session not started".to_string())
        })
    }

    fn check_session_started(&self) -> Result<()> {
        if self.state != State::SessionStarted {
            return Err(BootstrapError::IllegalState(
                "expected a started remote bootstrap session".to_string(),
            ));
        }
        Ok(())
    }

    fn update_status(&self, listener: &dyn StatusListener, message: &str) {
        listener.status_message(&format!("RemoteBootstrap: {}", message));
    }
}

fn count_block_refs(superblock: &pb::TabletSuperBlock) -> usize {
    superblock
        .rowsets
        .iter()
        .map(|rowset| {
            rowset.columns.len()
                + rowset.redo_deltas.len()
                + rowset.undo_deltas.len()
                + rowset.bloom_block.is_some() as usize
                + rowset.adhoc_index_block.is_some() as usize
        })
        .sum()
}
