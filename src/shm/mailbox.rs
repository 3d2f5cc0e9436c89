use anyhow::{bail, Context, Result};
use std::sync::atomic::{fence, Ordering};

use super::{Region, SharedRegion, ShmLayout};
use crate::config::TrackerParams;

const SEQ_OFFSET: usize = 0;
const LEN_OFFSET: usize = 8;
const PAYLOAD_OFFSET: usize = 64;
pub const MAILBOX_PAYLOAD: usize = 4096;
pub(super) const REGION_LEN: usize = PAYLOAD_OFFSET + MAILBOX_PAYLOAD;

/// Latest-value mailbox for tracking parameters.
///
/// The supervisor publishes whole `TrackerParams` snapshots, the tracker
/// picks up at most one per iteration. Intermediate values may be skipped
/// (last writer wins) but a reader never sees a mix of two snapshots: the
/// payload is guarded by a sequence counter that is odd while a write is in
/// progress.
pub struct ParamMailbox {
    region: SharedRegion,
    last_seen: u64,
}

impl ParamMailbox {
    pub fn create(layout: &ShmLayout) -> Result<Self> {
        Ok(Self {
            region: layout.create(Region::ParamMailbox)?,
            last_seen: 0,
        })
    }

    pub fn attach(layout: &ShmLayout) -> Result<Self> {
        Ok(Self {
            region: layout.attach(Region::ParamMailbox)?,
            last_seen: 0,
        })
    }

    /// Writer side. Only the supervisor publishes.
    pub fn publish(&mut self, params: &TrackerParams) -> Result<()> {
        let payload = bincode::serialize(params).context("failed to encode parameters")?;
        if payload.len() > MAILBOX_PAYLOAD {
            bail!(
                "encoded parameters are {} bytes, mailbox holds {}",
                payload.len(),
                MAILBOX_PAYLOAD
            );
        }

        let seq = self.region.atomic_u64(SEQ_OFFSET);
        let start = seq.load(Ordering::Relaxed);
        seq.store(start.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        // SAFETY: payload fits in the region after PAYLOAD_OFFSET; readers
        // discard anything they copy while the sequence is odd or changes.
        unsafe {
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                self.region.raw_ptr().add(PAYLOAD_OFFSET),
                payload.len(),
            );
        }
        self.region
            .atomic_u64(LEN_OFFSET)
            .store(payload.len() as u64, Ordering::Relaxed);

        seq.store(start.wrapping_add(2), Ordering::Release);
        Ok(())
    }

    /// Reader side. Returns the newest snapshot if it was published since
    /// the last successful call. A write in progress reads as "nothing new"
    /// and is picked up on a later call.
    pub fn take_update(&mut self) -> Result<Option<TrackerParams>> {
        match self.read_snapshot()? {
            Some((seq, params)) if seq != self.last_seen => {
                self.last_seen = seq;
                Ok(Some(params))
            }
            _ => Ok(None),
        }
    }

    /// Snapshot currently stored, regardless of whether it was seen.
    pub fn peek(&self) -> Result<Option<TrackerParams>> {
        Ok(self.read_snapshot()?.map(|(_, params)| params))
    }

    fn read_snapshot(&self) -> Result<Option<(u64, TrackerParams)>> {
        let seq = self.region.atomic_u64(SEQ_OFFSET);
        let before = seq.load(Ordering::Acquire);
        if before == 0 || before % 2 == 1 {
            return Ok(None);
        }

        let len = self.region.atomic_u64(LEN_OFFSET).load(Ordering::Relaxed) as usize;
        if len > MAILBOX_PAYLOAD {
            return Ok(None);
        }
        let mut payload = vec![0u8; len];
        // SAFETY: len is bounded by the payload area; a torn copy is
        // detected by the sequence check below.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.region.raw_ptr().add(PAYLOAD_OFFSET),
                payload.as_mut_ptr(),
                len,
            );
        }

        fence(Ordering::Acquire);
        if seq.load(Ordering::Relaxed) != before {
            return Ok(None);
        }

        let params = bincode::deserialize(&payload).context("malformed parameter snapshot")?;
        Ok(Some((before, params)))
    }
}
