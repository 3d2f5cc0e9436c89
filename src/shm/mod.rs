//! Named shared memory regions.
//!
//! Every region is a file `<prefix>_<name>` in the configured directory
//! (`/dev/shm` on Linux), mapped read-write into each process that uses it.
//! The supervisor creates and finally unlinks all of them; workers only
//! attach by name.
//!
//! Regions are single-writer, multi-reader and never locked. Frame and
//! history data may be observed half-written by a reader racing the writer.
//! Only [`TimestampQueue`], [`ParamMailbox`] and [`ControlBlock`] give
//! ordering guarantees, through atomics stored inside their regions.

mod control;
mod mailbox;
mod queue;
mod views;

pub use control::ControlBlock;
pub use mailbox::{ParamMailbox, MAILBOX_PAYLOAD};
pub use queue::TimestampQueue;
pub use views::{AngleHistory, FrameSlot, SegmentBuffer};

use anyhow::{bail, Context, Result};
use memmap2::MmapMut;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;

use crate::config::{Config, MAX_SEGMENT_POINTS};

/// Mapped shared region.
pub struct SharedRegion {
    name: String,
    path: PathBuf,
    ptr: *mut u8,
    len: usize,
    // ptr はこのマッピングを指す。drop でアンマップされる
    _map: MmapMut,
}

// SAFETY: the mapping lives as long as the struct; mutable access to the
// bytes goes through `&mut self`, shared mutation only through atomics.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Creates (or truncates) the region file and maps it zero-filled.
    pub fn create(dir: &Path, name: &str, len: usize) -> Result<Self> {
        if len == 0 {
            bail!("shared region `{}` must not be empty", name);
        }
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create shm dir {}", dir.display()))?;
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("failed to create shared region {}", path.display()))?;
        file.set_len(len as u64)
            .with_context(|| format!("failed to size shared region {}", path.display()))?;
        Self::map(name, path, &file, len)
    }

    /// Attaches to an existing region. A missing or undersized region means
    /// the owner has not set things up yet, which callers treat as fatal.
    pub fn attach(dir: &Path, name: &str, expected_len: usize) -> Result<Self> {
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| {
                format!(
                    "shared region `{}` not found at {} (was the supervisor started first?)",
                    name,
                    path.display()
                )
            })?;
        let actual = file
            .metadata()
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len() as usize;
        if actual < expected_len {
            bail!(
                "shared region `{}` is {} bytes, expected at least {} (stale region from another configuration?)",
                name,
                actual,
                expected_len
            );
        }
        Self::map(name, path, &file, expected_len)
    }

    fn map(name: &str, path: PathBuf, file: &fs::File, len: usize) -> Result<Self> {
        // SAFETY: the file is only ever resized by `create`, which happens
        // before any other process attaches.
        let mut map = unsafe { memmap2::MmapOptions::new().len(len).map_mut(file) }
            .with_context(|| format!("failed to map {}", path.display()))?;
        let ptr = map.as_mut_ptr();
        Ok(Self {
            name: name.to_string(),
            path,
            ptr,
            len,
            _map: map,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: ptr/len describe the live mapping.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` makes this handle's view exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Little-endian `f64` view of `count` values starting at byte `offset`.
    pub fn f64_slice(&self, offset: usize, count: usize) -> Result<&[f64]> {
        let bytes = self.byte_range(offset, count * 8)?;
        bytemuck::try_cast_slice(bytes)
            .map_err(|e| anyhow::anyhow!("region `{}` f64 view: {:?}", self.name, e))
    }

    pub fn f64_slice_mut(&mut self, offset: usize, count: usize) -> Result<&mut [f64]> {
        self.byte_range(offset, count * 8)?;
        let name = self.name.clone();
        let bytes = &mut self.bytes_mut()[offset..offset + count * 8];
        bytemuck::try_cast_slice_mut(bytes)
            .map_err(|e| anyhow::anyhow!("region `{}` f64 view: {:?}", name, e))
    }

    fn byte_range(&self, offset: usize, len: usize) -> Result<&[u8]> {
        if offset + len > self.len {
            bail!(
                "region `{}` range {}..{} out of bounds ({} bytes)",
                self.name,
                offset,
                offset + len,
                self.len
            );
        }
        Ok(&self.bytes()[offset..offset + len])
    }

    /// Atomic word stored in the region. Offsets are fixed by the owning
    /// primitive's layout and must be 8-byte aligned.
    pub(crate) fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        assert!(offset % 8 == 0 && offset + 8 <= self.len, "bad atomic offset {}", offset);
        // SAFETY: the mapping is page aligned, offset is 8-aligned and in
        // bounds, and words used as atomics are never accessed non-atomically.
        unsafe { &*(self.ptr.add(offset) as *const AtomicU64) }
    }

    pub(crate) fn raw_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Removes the backing file. Other processes keep their mappings until
    /// they drop them.
    pub fn unlink(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        fs::remove_file(&path).with_context(|| format!("failed to unlink {}", path.display()))
    }
}

/// The fixed set of regions, known by name at process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    RawFrame,
    ProcessedFrame,
    SegmentPositions,
    AngleHistory,
    TimestampQueue,
    ParamMailbox,
    Control,
}

impl Region {
    pub const ALL: [Region; 7] = [
        Region::RawFrame,
        Region::ProcessedFrame,
        Region::SegmentPositions,
        Region::AngleHistory,
        Region::TimestampQueue,
        Region::ParamMailbox,
        Region::Control,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::RawFrame => "raw_frame",
            Region::ProcessedFrame => "processed_frame",
            Region::SegmentPositions => "segment_positions",
            Region::AngleHistory => "angle_history",
            Region::TimestampQueue => "timestamp_queue",
            Region::ParamMailbox => "param_mailbox",
            Region::Control => "control",
        }
    }
}

/// Names and sizes of every region, derived from the configuration so
/// that all processes agree on them.
#[derive(Debug, Clone)]
pub struct ShmLayout {
    pub dir: PathBuf,
    pub prefix: String,
    pub frame_capacity: usize,
    pub queue_capacity: usize,
    pub trace_length: usize,
    pub max_points: usize,
}

impl ShmLayout {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dir: config.shm.dir.clone(),
            prefix: config.shm.prefix.clone(),
            frame_capacity: config.shm.frame_capacity,
            queue_capacity: config.shm.timestamp_queue_capacity,
            trace_length: config.tracking.angle_trace_length,
            max_points: MAX_SEGMENT_POINTS,
        }
    }

    pub fn region_name(&self, region: Region) -> String {
        format!("{}_{}", self.prefix, region.as_str())
    }

    pub fn region_len(&self, region: Region) -> usize {
        match region {
            Region::RawFrame | Region::ProcessedFrame => self.frame_capacity,
            Region::SegmentPositions => 16 * self.max_points,
            Region::AngleHistory => 16 * self.trace_length,
            Region::TimestampQueue => queue::region_len(self.queue_capacity),
            Region::ParamMailbox => mailbox::REGION_LEN,
            Region::Control => control::REGION_LEN,
        }
    }

    pub fn create(&self, region: Region) -> Result<SharedRegion> {
        SharedRegion::create(&self.dir, &self.region_name(region), self.region_len(region))
    }

    pub fn attach(&self, region: Region) -> Result<SharedRegion> {
        SharedRegion::attach(&self.dir, &self.region_name(region), self.region_len(region))
    }

    /// Removes every region file that exists. Used by the owner after its
    /// workers have exited or been killed.
    pub fn unlink_all(&self) -> Result<usize> {
        let mut removed = 0;
        for region in Region::ALL {
            let path = self.dir.join(self.region_name(region));
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to unlink {}", path.display()))
                }
            }
        }
        Ok(removed)
    }
}

/// Every region, typed. The supervisor creates the set; workers attach
/// to the parts they use.
pub struct RegionSet {
    pub raw_frame: FrameSlot,
    pub processed_frame: FrameSlot,
    pub segments: SegmentBuffer,
    pub history: AngleHistory,
    pub queue: TimestampQueue,
    pub params: ParamMailbox,
    pub control: ControlBlock,
}

impl RegionSet {
    /// Creates every region. Existing files with the same names are reset.
    pub fn create_all(layout: &ShmLayout) -> Result<Self> {
        Ok(Self {
            raw_frame: FrameSlot::create(layout, Region::RawFrame)?,
            processed_frame: FrameSlot::create(layout, Region::ProcessedFrame)?,
            segments: SegmentBuffer::create(layout)?,
            history: AngleHistory::create(layout)?,
            queue: TimestampQueue::create(layout)?,
            params: ParamMailbox::create(layout)?,
            control: ControlBlock::create(layout)?,
        })
    }

    pub fn attach_all(layout: &ShmLayout) -> Result<Self> {
        Ok(Self {
            raw_frame: FrameSlot::attach(layout, Region::RawFrame)?,
            processed_frame: FrameSlot::attach(layout, Region::ProcessedFrame)?,
            segments: SegmentBuffer::attach(layout)?,
            history: AngleHistory::attach(layout)?,
            queue: TimestampQueue::attach(layout)?,
            params: ParamMailbox::attach(layout)?,
            control: ControlBlock::attach(layout)?,
        })
    }
}

#[cfg(test)]
pub(crate) fn test_layout(dir: &Path) -> ShmLayout {
    ShmLayout {
        dir: dir.to_path_buf(),
        prefix: "test".to_string(),
        frame_capacity: 64 * 1024,
        queue_capacity: 8,
        trace_length: 32,
        max_points: MAX_SEGMENT_POINTS,
    }
}
