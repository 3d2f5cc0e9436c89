use anyhow::{bail, Result};
use ndarray::ArrayView2;

use super::{Region, SharedRegion, ShmLayout};
use crate::frame::{self, Frame};

/// One image slot (`raw_frame` or `processed_frame`).
pub struct FrameSlot {
    region: SharedRegion,
}

impl FrameSlot {
    pub fn create(layout: &ShmLayout, region: Region) -> Result<Self> {
        Self::check(region)?;
        Ok(Self {
            region: layout.create(region)?,
        })
    }

    pub fn attach(layout: &ShmLayout, region: Region) -> Result<Self> {
        Self::check(region)?;
        Ok(Self {
            region: layout.attach(region)?,
        })
    }

    fn check(region: Region) -> Result<()> {
        if !matches!(region, Region::RawFrame | Region::ProcessedFrame) {
            bail!("`{}` is not a frame region", region.as_str());
        }
        Ok(())
    }

    pub fn write(&mut self, image: ArrayView2<u8>) -> Result<()> {
        frame::encode(image, self.region.bytes_mut())
    }

    /// `None` until the first frame has been written.
    pub fn read(&self) -> Result<Option<Frame>> {
        let bytes = self.region.bytes();
        if !frame::has_frame(bytes) {
            return Ok(None);
        }
        frame::decode(bytes).map(Some)
    }
}

/// Tail segment points of the latest tracked frame, stored as a `(2, N)`
/// `f64` array: x coordinates, then y coordinates. Unused slots are NaN.
pub struct SegmentBuffer {
    region: SharedRegion,
    max_points: usize,
}

impl SegmentBuffer {
    pub fn create(layout: &ShmLayout) -> Result<Self> {
        let mut buffer = Self {
            region: layout.create(Region::SegmentPositions)?,
            max_points: layout.max_points,
        };
        buffer.write(&[])?;
        Ok(buffer)
    }

    pub fn attach(layout: &ShmLayout) -> Result<Self> {
        Ok(Self {
            region: layout.attach(Region::SegmentPositions)?,
            max_points: layout.max_points,
        })
    }

    pub fn max_points(&self) -> usize {
        self.max_points
    }

    pub fn write(&mut self, points: &[(f64, f64)]) -> Result<()> {
        if points.len() > self.max_points {
            bail!(
                "{} segment points exceed the {} slot buffer",
                points.len(),
                self.max_points
            );
        }
        let n = self.max_points;
        let values = self.region.f64_slice_mut(0, 2 * n)?;
        values.fill(f64::NAN);
        for (i, (x, y)) in points.iter().enumerate() {
            values[i] = *x;
            values[n + i] = *y;
        }
        Ok(())
    }

    /// Points up to the first unused slot.
    pub fn read(&self) -> Result<Vec<(f64, f64)>> {
        let n = self.max_points;
        let values = self.region.f64_slice(0, 2 * n)?;
        Ok((0..n)
            .take_while(|&i| !values[i].is_nan())
            .map(|i| (values[i], values[n + i]))
            .collect())
    }
}

/// Ring of the last `L` tail angles, stored as a `(2, L)` `f64` array:
/// angles, then their timestamps. A zero timestamp marks a slot never
/// written.
pub struct AngleHistory {
    region: SharedRegion,
    capacity: usize,
    next: usize,
}

impl AngleHistory {
    pub fn create(layout: &ShmLayout) -> Result<Self> {
        Self::open(layout.create(Region::AngleHistory)?, layout.trace_length)
    }

    pub fn attach(layout: &ShmLayout) -> Result<Self> {
        Self::open(layout.attach(Region::AngleHistory)?, layout.trace_length)
    }

    fn open(region: SharedRegion, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            bail!("angle history needs at least one slot");
        }
        Ok(Self {
            region,
            capacity,
            next: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Writes at this handle's counter modulo `L` and advances it.
    pub fn push(&mut self, angle: f64, timestamp: f64) -> Result<()> {
        let index = self.next;
        self.write_at(index, angle, timestamp)?;
        self.next = self.next.wrapping_add(1);
        Ok(())
    }

    pub fn write_at(&mut self, index: usize, angle: f64, timestamp: f64) -> Result<()> {
        let l = self.capacity;
        let slot = index % l;
        let values = self.region.f64_slice_mut(0, 2 * l)?;
        values[slot] = angle;
        values[l + slot] = timestamp;
        Ok(())
    }

    /// `(angle, timestamp)` stored at `index % L`.
    pub fn slot(&self, index: usize) -> Result<(f64, f64)> {
        let l = self.capacity;
        let values = self.region.f64_slice(0, 2 * l)?;
        let slot = index % l;
        Ok((values[slot], values[l + slot]))
    }

    /// Written samples as `(timestamp, angle)`, oldest first.
    pub fn samples(&self) -> Result<Vec<(f64, f64)>> {
        let l = self.capacity;
        let values = self.region.f64_slice(0, 2 * l)?;
        let mut samples: Vec<(f64, f64)> = (0..l)
            .filter(|&i| values[l + i] > 0.0)
            .map(|i| (values[l + i], values[i]))
            .collect();
        samples.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(samples)
    }
}
