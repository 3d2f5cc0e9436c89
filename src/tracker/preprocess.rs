use anyhow::{Context, Result};
use ndarray::{Array2, ArrayView2};

use crate::config::TrackerParams;
use crate::frame::Frame;

/// scale → box blur → invert → clip. 追跡はこの出力の座標系で行う
pub fn preprocess(frame: ArrayView2<u8>, params: &TrackerParams) -> Result<Frame> {
    let mut img = resize(frame, params.image_scale).context("resize failed")?;
    if params.filter_size > 1 {
        img = box_blur(img.view(), params.filter_size).context("box filter failed")?;
    }
    if params.color_invert {
        img.mapv_inplace(|p| 255 - p);
    }
    if params.clip_threshold > 0 {
        let threshold = params.clip_threshold;
        img.mapv_inplace(|p| p.saturating_sub(threshold));
    }
    Ok(img)
}

/// Output size for one axis: `round(n * scale)`, at least 1.
pub fn scaled_len(n: usize, scale: f64) -> usize {
    ((n as f64 * scale).round() as usize).max(1)
}

/// Area-average resize when shrinking, nearest neighbour when growing.
pub fn resize(frame: ArrayView2<u8>, scale: f64) -> Result<Frame> {
    let (rows, cols) = frame.dim();
    if scale == 1.0 || rows == 0 || cols == 0 {
        return Ok(frame.to_owned());
    }
    let out = (scaled_len(rows, scale), scaled_len(cols, scale));
    backend::resize(frame, out, scale < 1.0)
}

/// Normalized `k x k` box filter centered on each pixel, reflect-101
/// borders. `k` must be odd.
pub fn box_blur(img: ArrayView2<u8>, k: usize) -> Result<Frame> {
    let (rows, cols) = img.dim();
    if k <= 1 || rows == 0 || cols == 0 {
        return Ok(img.to_owned());
    }
    anyhow::ensure!(k % 2 == 1, "box filter size must be odd, got {}", k);
    backend::box_blur(img, k)
}

fn pixels(frame: ArrayView2<u8>) -> Vec<u8> {
    frame.iter().copied().collect()
}

/// OpenCV の INTER_AREA / boxFilter(BORDER_REFLECT_101)
#[cfg(feature = "camera")]
mod backend {
    use anyhow::Result;
    use ndarray::{Array2, ArrayView2};
    use opencv::{
        core::{self, Mat, Point, Scalar, Size},
        imgproc,
        prelude::*,
    };

    use super::pixels;
    use crate::frame::Frame;

    fn to_mat(frame: ArrayView2<u8>) -> Result<Mat> {
        let (rows, cols) = frame.dim();
        let mut mat = Mat::new_rows_cols_with_default(
            rows as i32,
            cols as i32,
            core::CV_8UC1,
            Scalar::all(0.0),
        )?;
        mat.data_bytes_mut()?.copy_from_slice(&pixels(frame));
        Ok(mat)
    }

    fn to_frame(mat: &Mat) -> Result<Frame> {
        let shape = (mat.rows() as usize, mat.cols() as usize);
        Ok(Array2::from_shape_vec(shape, mat.data_bytes()?.to_vec())?)
    }

    pub fn resize(
        frame: ArrayView2<u8>,
        (rows, cols): (usize, usize),
        shrink: bool,
    ) -> Result<Frame> {
        let src = to_mat(frame)?;
        let mut dst = Mat::default();
        let interpolation = if shrink { imgproc::INTER_AREA } else { imgproc::INTER_NEAREST };
        let size = Size::new(cols as i32, rows as i32);
        imgproc::resize(&src, &mut dst, size, 0.0, 0.0, interpolation)?;
        to_frame(&dst)
    }

    pub fn box_blur(img: ArrayView2<u8>, k: usize) -> Result<Frame> {
        let src = to_mat(img)?;
        let mut dst = Mat::default();
        let k = k as i32;
        imgproc::box_filter(
            &src,
            &mut dst,
            -1,
            Size::new(k, k),
            Point::new(-1, -1),
            true,
            core::BORDER_REFLECT_101,
        )?;
        to_frame(&dst)
    }
}

/// fast_image_resize (Box 畳み込み = 面積平均) と imageproc の box_filter
#[cfg(not(feature = "camera"))]
mod backend {
    use anyhow::{Context, Result};
    use fast_image_resize as fr;
    use image::GrayImage;
    use imageproc::filter::box_filter;
    use ndarray::{Array2, ArrayView2};

    use super::pixels;
    use crate::frame::Frame;

    pub fn resize(
        frame: ArrayView2<u8>,
        (rows, cols): (usize, usize),
        shrink: bool,
    ) -> Result<Frame> {
        let (src_rows, src_cols) = frame.dim();
        let src = fr::images::Image::from_vec_u8(
            src_cols as u32,
            src_rows as u32,
            pixels(frame),
            fr::PixelType::U8,
        )?;
        let mut dst = fr::images::Image::new(cols as u32, rows as u32, fr::PixelType::U8);
        let alg = if shrink {
            fr::ResizeAlg::Convolution(fr::FilterType::Box)
        } else {
            fr::ResizeAlg::Nearest
        };
        fr::Resizer::new().resize(&src, &mut dst, &fr::ResizeOptions::new().resize_alg(alg))?;
        Ok(Array2::from_shape_vec((rows, cols), dst.buffer().to_vec())?)
    }

    /// imageproc は端をクランプするので、半径分 reflect-101 で埋めてから掛けて切り出す
    pub fn box_blur(img: ArrayView2<u8>, k: usize) -> Result<Frame> {
        let (rows, cols) = img.dim();
        let r = k / 2;
        let shift = r as isize;
        let padded = Array2::from_shape_fn((rows + 2 * r, cols + 2 * r), |(y, x)| {
            img[[
                reflect101(y as isize - shift, rows),
                reflect101(x as isize - shift, cols),
            ]]
        });
        let (width, height) = (padded.ncols() as u32, padded.nrows() as u32);
        let gray = GrayImage::from_raw(width, height, pixels(padded.view()))
            .context("padded image has the wrong size")?;
        let blurred = box_filter(&gray, r as u32, r as u32);
        Ok(Array2::from_shape_fn((rows, cols), |(y, x)| {
            blurred.get_pixel((x + r) as u32, (y + r) as u32)[0]
        }))
    }

    pub(super) fn reflect101(i: isize, n: usize) -> usize {
        if n == 1 {
            return 0;
        }
        let n = n as isize;
        let mut i = i;
        while i < 0 || i >= n {
            if i < 0 {
                i = -i;
            }
            if i >= n {
                i = 2 * (n - 1) - i;
            }
        }
        i as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_FILTER_SIZE;

    fn params() -> TrackerParams {
        TrackerParams {
            image_scale: 1.0,
            filter_size: 1,
            color_invert: false,
            clip_threshold: 0,
            ..TrackerParams::default()
        }
    }

    #[test]
    fn test_identity_when_everything_off() {
        let img = Array2::from_shape_fn((5, 7), |(r, c)| (r * 7 + c) as u8);
        assert_eq!(preprocess(img.view(), &params()).unwrap(), img);
    }

    #[test]
    fn test_invert_then_clip() {
        let img = Array2::from_shape_vec((1, 4), vec![0u8, 100, 200, 255]).unwrap();
        let p = TrackerParams {
            color_invert: true,
            clip_threshold: 60,
            ..params()
        };
        // invert: 255 155 55 0 -> clip 60: 195 95 0 0
        let out = preprocess(img.view(), &p).unwrap();
        assert_eq!(out.as_slice().unwrap(), &[195, 95, 0, 0]);
    }

    #[test]
    fn test_half_scale_averages_blocks() {
        let img = Array2::from_shape_vec((2, 4), vec![0u8, 10, 100, 200, 20, 30, 100, 200]).unwrap();
        let out = resize(img.view(), 0.5).unwrap();
        assert_eq!(out.dim(), (1, 2));
        assert_eq!(out.as_slice().unwrap(), &[15, 150]);
    }

    #[test]
    fn test_fractional_scale_preserves_flat_image() {
        let img = Array2::from_elem((30, 45), 77u8);
        let out = resize(img.view(), 0.3).unwrap();
        assert_eq!(out.dim(), (9, 14));
        assert!(out.iter().all(|&p| p == 77));
    }

    #[test]
    fn test_upscale_nearest() {
        let img = Array2::from_shape_vec((1, 2), vec![5u8, 9]).unwrap();
        let out = resize(img.view(), 2.0).unwrap();
        assert_eq!(out.as_slice().unwrap(), &[5, 5, 9, 9, 5, 5, 9, 9]);
    }

    #[test]
    fn test_scaled_len_never_zero() {
        assert_eq!(scaled_len(3, 0.1), 1);
        assert_eq!(scaled_len(100, 0.25), 25);
    }

    #[test]
    fn test_box_blur_flat_and_impulse() {
        let flat = Array2::from_elem((6, 6), 90u8);
        assert_eq!(box_blur(flat.view(), 3).unwrap(), flat);

        let mut impulse = Array2::<u8>::zeros((5, 5));
        impulse[[2, 2]] = 180;
        let out = box_blur(impulse.view(), 3).unwrap();
        assert_eq!(out[[2, 2]], 20);
        assert_eq!(out[[1, 1]], 20);
        assert_eq!(out[[0, 0]], 0);
    }

    #[test]
    fn test_box_blur_reflects_border() {
        // reflect-101: 列 -1 は列 1
        let img = Array2::from_shape_vec((1, 3), vec![0u8, 90, 0]).unwrap();
        let out = box_blur(img.view(), 3).unwrap();
        // 行方向も reflect なので各行同じ値 -> (90+0+90)/3 = 60
        assert_eq!(out[[0, 0]], 60);
        assert_eq!(out[[0, 1]], 30);
    }

    #[test]
    fn test_box_blur_large_kernel_on_small_frame() {
        // 画像より大きいカーネルでも飽和・オーバーフローしない
        let flat = Array2::from_elem((4, 4), 255u8);
        let out = box_blur(flat.view(), MAX_FILTER_SIZE).unwrap();
        assert!(out.iter().all(|&p| p == 255));

        let p = TrackerParams {
            filter_size: MAX_FILTER_SIZE,
            ..params()
        };
        assert_eq!(preprocess(flat.view(), &p).unwrap(), flat);
    }

    #[test]
    fn test_box_blur_rejects_even_size() {
        let img = Array2::from_elem((4, 4), 10u8);
        assert!(box_blur(img.view(), 4).is_err());
    }

    #[cfg(not(feature = "camera"))]
    #[test]
    fn test_reflect101() {
        use super::backend::reflect101;

        assert_eq!(reflect101(-1, 5), 1);
        assert_eq!(reflect101(-2, 5), 2);
        assert_eq!(reflect101(5, 5), 3);
        assert_eq!(reflect101(2, 5), 2);
        assert_eq!(reflect101(-3, 1), 0);
    }
}
