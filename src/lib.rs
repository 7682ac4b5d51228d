//! Remote bootstrap client for tablet replicas.
//!
//! Streams a tablet's persistent state (durable log segments and data
//! blocks) from the current consensus leader of its replication group,
//! rewrites block references into the local storage manager's namespace,
//! and atomically installs the resulting tablet metadata.

pub mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod fs_manager;
pub mod metadata;
pub mod metrics;
pub mod peer;
pub mod proxy;

/// Protocol buffer definitions for the remote bootstrap service.
pub mod pb {
    #![allow(clippy::derive_partial_eq_without_eq)]
    tonic::include_proto!("remote_bootstrap");
}

pub use client::{LogStatusListener, RemoteBootstrapClient, StatusListener};
pub use config::BootstrapConfig;
pub use error::{BootstrapError, Result};
