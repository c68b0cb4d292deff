//! Engine wiring: disk manager and buffer pool from one configuration.

use std::sync::Arc;

use crate::disk::{DiskManager, DiskManagerConfig};
use cairn_buffer::BufferManager;
use cairn_common::{EngineConfig, Result};

/// Opens the storage engine described by `config`: a disk manager
/// rooted at its data directory and a buffer pool over it.
pub fn open_engine(config: &EngineConfig) -> Result<(Arc<DiskManager>, Arc<BufferManager>)> {
    let disk = Arc::new(DiskManager::new(DiskManagerConfig {
        data_dir: config.data_dir.clone(),
        fsync_enabled: config.fsync_enabled,
    })?);
    let buf = Arc::new(BufferManager::new(config.buffer_pool_frames, disk.clone()));
    Ok((disk, buf))
}
