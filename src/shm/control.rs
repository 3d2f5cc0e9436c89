use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{Region, SharedRegion, ShmLayout};

const SHUTDOWN: usize = 0;
const CONNECT_REQUESTED: usize = 8;
const CONNECTION_LOST: usize = 16;
const CONNECTED: usize = 24;
const FRAMES_ACQUIRED: usize = 32;
const FRAMES_TRACKED: usize = 40;
pub(super) const REGION_LEN: usize = 64;

/// Cross-process flags and counters shared by all three processes.
///
/// `connection_lost` is an edge: the tracker raises it, the supervisor
/// consumes it with [`ControlBlock::take_connection_lost`].
pub struct ControlBlock {
    region: SharedRegion,
}

impl ControlBlock {
    pub fn create(layout: &ShmLayout) -> Result<Self> {
        Ok(Self {
            region: layout.create(Region::Control)?,
        })
    }

    pub fn attach(layout: &ShmLayout) -> Result<Self> {
        Ok(Self {
            region: layout.attach(Region::Control)?,
        })
    }

    fn word(&self, offset: usize) -> &AtomicU64 {
        self.region.atomic_u64(offset)
    }

    pub fn request_shutdown(&self) {
        self.word(SHUTDOWN).store(1, Ordering::Release);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.word(SHUTDOWN).load(Ordering::Acquire) != 0
    }

    /// Asks the tracker to accept one downstream connection.
    pub fn request_connection(&self) {
        self.word(CONNECT_REQUESTED).store(1, Ordering::Release);
    }

    pub fn connection_requested(&self) -> bool {
        self.word(CONNECT_REQUESTED).load(Ordering::Acquire) != 0
    }

    pub fn take_connection_request(&self) -> bool {
        self.word(CONNECT_REQUESTED).swap(0, Ordering::AcqRel) != 0
    }

    pub fn raise_connection_lost(&self) {
        self.word(CONNECTION_LOST).store(1, Ordering::Release);
    }

    pub fn take_connection_lost(&self) -> bool {
        self.word(CONNECTION_LOST).swap(0, Ordering::AcqRel) != 0
    }

    pub fn set_connected(&self, connected: bool) {
        self.word(CONNECTED)
            .store(connected as u64, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.word(CONNECTED).load(Ordering::Acquire) != 0
    }

    pub fn add_frames_acquired(&self, n: u64) {
        self.word(FRAMES_ACQUIRED).fetch_add(n, Ordering::Relaxed);
    }

    pub fn frames_acquired(&self) -> u64 {
        self.word(FRAMES_ACQUIRED).load(Ordering::Relaxed)
    }

    pub fn add_frames_tracked(&self, n: u64) {
        self.word(FRAMES_TRACKED).fetch_add(n, Ordering::Relaxed);
    }

    pub fn frames_tracked(&self) -> u64 {
        self.word(FRAMES_TRACKED).load(Ordering::Relaxed)
    }
}
