//! Frame codec: packs a 2-D 8-bit image into a fixed-capacity flat buffer.
//!
//! Layout of a buffer with capacity `C`:
//!
//! ```text
//! [0, rows*cols)   row-major pixels
//! [C-8, C-4)       rows (u32, little endian)
//! [C-4, C)         cols (u32, little endian)
//! ```
//!
//! A zero `rows` or `cols` means nothing has been written yet.

use anyhow::{bail, Result};
use ndarray::{Array2, ArrayView2};

/// 8-bit grayscale image, `[rows, cols]`.
pub type Frame = Array2<u8>;

pub const TRAILER_LEN: usize = 8;

/// Largest pixel payload a buffer of `capacity` bytes can hold.
pub fn max_pixels(capacity: usize) -> usize {
    capacity.saturating_sub(TRAILER_LEN)
}

pub fn encode(frame: ArrayView2<u8>, buf: &mut [u8]) -> Result<()> {
    let (rows, cols) = frame.dim();
    if rows == 0 || cols == 0 {
        bail!("cannot encode an empty {}x{} frame", rows, cols);
    }
    if rows > u32::MAX as usize || cols > u32::MAX as usize {
        bail!("frame dimensions {}x{} exceed u32", rows, cols);
    }
    let size = rows * cols;
    if size + TRAILER_LEN > buf.len() {
        bail!(
            "frame {}x{} ({} bytes) does not fit a {} byte buffer",
            rows,
            cols,
            size,
            buf.len()
        );
    }

    match frame.as_slice() {
        Some(pixels) => buf[..size].copy_from_slice(pixels),
        None => {
            // 非連続ビュー (スライス等) は行ごとにコピー
            for (dst, src) in buf[..size].iter_mut().zip(frame.iter()) {
                *dst = *src;
            }
        }
    }

    let trailer = buf.len() - TRAILER_LEN;
    buf[trailer..trailer + 4].copy_from_slice(&(rows as u32).to_le_bytes());
    buf[trailer + 4..].copy_from_slice(&(cols as u32).to_le_bytes());
    Ok(())
}

/// Reads `(rows, cols)` from the trailer without validating them.
pub fn trailer_dims(buf: &[u8]) -> (usize, usize) {
    if buf.len() < TRAILER_LEN {
        return (0, 0);
    }
    let trailer = buf.len() - TRAILER_LEN;
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[trailer..trailer + 4]);
    let rows = u32::from_le_bytes(word) as usize;
    word.copy_from_slice(&buf[trailer + 4..]);
    let cols = u32::from_le_bytes(word) as usize;
    (rows, cols)
}

/// False until a frame has been written into `buf`.
pub fn has_frame(buf: &[u8]) -> bool {
    let (rows, cols) = trailer_dims(buf);
    rows != 0 && cols != 0
}

/// Copies the frame out of `buf`. Check [`has_frame`] first.
pub fn decode(buf: &[u8]) -> Result<Frame> {
    let (rows, cols) = trailer_dims(buf);
    if rows == 0 || cols == 0 {
        bail!("buffer holds no frame");
    }
    let size = rows
        .checked_mul(cols)
        .filter(|size| size + TRAILER_LEN <= buf.len());
    let Some(size) = size else {
        bail!(
            "corrupt frame header {}x{} for a {} byte buffer",
            rows,
            cols,
            buf.len()
        );
    };
    Ok(Array2::from_shape_vec((rows, cols), buf[..size].to_vec())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_round_trip_random_shapes() {
        let mut rng = rand::thread_rng();
        let mut buf = vec![0u8; 254 * 254 + TRAILER_LEN];
        for _ in 0..50 {
            let rows = rng.gen_range(1..=254);
            let cols = rng.gen_range(1..=254);
            let frame = Array2::from_shape_fn((rows, cols), |_| rng.gen::<u8>());
            encode(frame.view(), &mut buf).unwrap();
            assert!(has_frame(&buf));
            assert_eq!(decode(&buf).unwrap(), frame);
        }
    }

    #[test]
    fn test_large_dimensions_survive() {
        // 255 以上の辺でも壊れない
        let frame = Array2::from_shape_fn((3, 70_000), |(r, c)| ((r * 7 + c) % 251) as u8);
        let mut buf = vec![0u8; 3 * 70_000 + TRAILER_LEN];
        encode(frame.view(), &mut buf).unwrap();
        assert_eq!(trailer_dims(&buf), (3, 70_000));
        assert_eq!(decode(&buf).unwrap(), frame);
    }

    #[test]
    fn test_too_large_frame_is_error() {
        let frame = Array2::<u8>::zeros((10, 10));
        let mut buf = vec![0u8; 100 + TRAILER_LEN - 1];
        assert!(encode(frame.view(), &mut buf).is_err());
        assert!(!has_frame(&buf));

        let mut exact = vec![0u8; 100 + TRAILER_LEN];
        assert!(encode(frame.view(), &mut exact).is_ok());
    }

    #[test]
    fn test_empty_buffer_has_no_frame() {
        let buf = vec![0u8; 64];
        assert!(!has_frame(&buf));
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn test_corrupt_header_rejected() {
        let mut buf = vec![0u8; 64];
        let trailer = buf.len() - TRAILER_LEN;
        buf[trailer..trailer + 4].copy_from_slice(&100u32.to_le_bytes());
        buf[trailer + 4..].copy_from_slice(&100u32.to_le_bytes());
        assert!(has_frame(&buf));
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn test_non_contiguous_view() {
        let frame = Array2::from_shape_fn((6, 8), |(r, c)| (r * 8 + c) as u8);
        let transposed = frame.t();
        let mut buf = vec![0u8; 128];
        encode(transposed, &mut buf).unwrap();
        assert_eq!(decode(&buf).unwrap(), transposed.to_owned());
    }

    #[test]
    fn test_smaller_frame_overwrites_larger() {
        let mut buf = vec![0u8; 256];
        let big = Array2::from_elem((10, 20), 9u8);
        let small = Array2::from_elem((2, 3), 1u8);
        encode(big.view(), &mut buf).unwrap();
        encode(small.view(), &mut buf).unwrap();
        assert_eq!(decode(&buf).unwrap(), small);
    }
}
