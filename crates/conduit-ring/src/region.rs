//! Mapping of one shared region (a file or a PCI/virtio-backed device node).
//!
//! Layout: byte 0 is the `head` cursor, byte 1 the `tail` cursor, then 256
//! fixed-size segments. Cursor bytes are accessed through `AtomicU8` views
//! into the mapping; the peer process polls them, so stores use `Release`
//! and loads `Acquire`.

use std::{
    fs::OpenOptions,
    io::{Seek, SeekFrom},
    path::Path,
    sync::atomic::{AtomicU8, Ordering, fence},
};

use memmap2::MmapMut;
use tracing::debug;

use crate::{FRAME_LEN, error::RegionError};

pub const NUM_SEGMENTS: usize = 256;
const CURSOR_BYTES: usize = 2;

/// How a completed segment write is made visible to the peer.
///
/// `Fence` is enough where the backing store is cache-coherent (Linux PCI
/// BAR); `FileSync` msyncs the written range, which macOS file-backed
/// mappings need before the hypervisor exposes the bytes to the other side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPolicy {
    Fence,
    FileSync,
}

impl SyncPolicy {
    pub fn default_for_os() -> Self {
        if cfg!(target_os = "macos") { Self::FileSync } else { Self::Fence }
    }
}

pub struct SharedRegion {
    map: MmapMut,
    seg_size: usize,
    sync: SyncPolicy,
}

impl SharedRegion {
    /// Map `path`, creating and sizing a regular file to `default_len` when
    /// it does not exist or is empty. Device nodes are taken at the size
    /// they report.
    pub fn open(
        path: impl AsRef<Path>,
        default_len: u64,
        sync: SyncPolicy,
    ) -> Result<Self, RegionError> {
        let path = path.as_ref();
        let mut file =
            OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;

        // Block devices report len 0 through metadata; seek to find out.
        let mut len = file.seek(SeekFrom::End(0))?;
        if len == 0 {
            file.set_len(default_len)?;
            len = default_len;
        }

        let seg_size = (len.saturating_sub(CURSOR_BYTES as u64) as usize) / NUM_SEGMENTS;
        if seg_size <= FRAME_LEN {
            return Err(RegionError::TooSmall(len));
        }

        let map = unsafe { MmapMut::map_mut(&file)? };
        debug!(?path, len, seg_size, ?sync, "mapped shared region");
        Ok(Self { map, seg_size, sync })
    }

    pub fn seg_size(&self) -> usize {
        self.seg_size
    }

    /// Payload bytes one segment can carry after its frame header.
    pub fn payload_capacity(&self) -> usize {
        self.seg_size - FRAME_LEN
    }

    fn cursor(&self, at: usize) -> &AtomicU8 {
        unsafe { &*self.map.as_ptr().add(at).cast::<AtomicU8>() }
    }

    pub fn head(&self) -> u8 {
        self.cursor(0).load(Ordering::Acquire)
    }

    pub fn tail(&self) -> u8 {
        self.cursor(1).load(Ordering::Acquire)
    }

    pub fn set_head(&self, v: u8) {
        self.cursor(0).store(v, Ordering::Release);
        self.sync_range(0, 1);
    }

    pub fn set_tail(&self, v: u8) {
        self.cursor(1).store(v, Ordering::Release);
        self.sync_range(1, 1);
    }

    fn seg_offset(&self, idx: u8) -> usize {
        CURSOR_BYTES + idx as usize * self.seg_size
    }

    pub fn segment(&self, idx: u8) -> &[u8] {
        let at = self.seg_offset(idx);
        &self.map[at..at + self.seg_size]
    }

    pub fn segment_mut(&mut self, idx: u8) -> &mut [u8] {
        let at = self.seg_offset(idx);
        &mut self.map[at..at + self.seg_size]
    }

    /// Make a finished segment write visible before the cursor advance that
    /// publishes it.
    pub fn publish_segment(&self, idx: u8) {
        let at = self.seg_offset(idx);
        self.sync_range(at, self.seg_size);
    }

    fn sync_range(&self, at: usize, len: usize) {
        match self.sync {
            SyncPolicy::Fence => fence(Ordering::Release),
            SyncPolicy::FileSync => {
                // Nothing to do about an msync failure mid-stream; the
                // heartbeat restart is the recovery path.
                let _ = self.map.flush_range(at, len);
            }
        }
    }
}
