use anyhow::{Context, Result};
use ndarray::Array2;
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureAPIs, VideoCaptureTrait},
};

use super::source::{FrameSource, TimedFrame};
use crate::clock;

/// OpenCVを使用したカメラキャプチャ。フレームはグレースケールに変換する
pub struct OpenCvSource {
    index: i32,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    capture: Option<VideoCapture>,
}

impl OpenCvSource {
    pub fn new(index: i32, width: Option<u32>, height: Option<u32>, fps: Option<u32>) -> Self {
        Self {
            index,
            width,
            height,
            fps,
            capture: None,
        }
    }

    /// 解像度を取得 (initialize 後のみ)
    pub fn resolution(&self) -> Option<(u32, u32)> {
        let capture = self.capture.as_ref()?;
        let w = capture.get(videoio::CAP_PROP_FRAME_WIDTH).ok()? as u32;
        let h = capture.get(videoio::CAP_PROP_FRAME_HEIGHT).ok()? as u32;
        Some((w, h))
    }
}

impl FrameSource for OpenCvSource {
    fn name(&self) -> &str {
        "opencv"
    }

    /// 解像度とFPSを指定してカメラを開く
    fn initialize(&mut self) -> Result<()> {
        let mut capture = VideoCapture::new(self.index, VideoCaptureAPIs::CAP_ANY as i32)
            .context("Failed to open camera")?;

        if !capture.is_opened()? {
            anyhow::bail!("Camera {} is not available", self.index);
        }

        if let Some(w) = self.width {
            capture.set(videoio::CAP_PROP_FRAME_WIDTH, w as f64)?;
        }
        if let Some(h) = self.height {
            capture.set(videoio::CAP_PROP_FRAME_HEIGHT, h as f64)?;
        }
        if let Some(f) = self.fps {
            capture.set(videoio::CAP_PROP_FPS, f as f64)?;
        }
        // 常に最新フレームを取る
        capture.set(videoio::CAP_PROP_BUFFERSIZE, 1.0)?;

        tracing::info!(
            index = self.index,
            width = capture.get(videoio::CAP_PROP_FRAME_WIDTH)?,
            height = capture.get(videoio::CAP_PROP_FRAME_HEIGHT)?,
            fps = capture.get(videoio::CAP_PROP_FPS)?,
            "camera opened"
        );
        self.capture = Some(capture);
        Ok(())
    }

    fn fetch_image(&mut self) -> Result<Option<TimedFrame>> {
        let Some(capture) = self.capture.as_mut() else {
            anyhow::bail!("camera {} used before initialize()", self.index);
        };
        let mut frame = Mat::default();
        if !capture.read(&mut frame).context("Failed to read frame")? || frame.empty() {
            return Ok(None);
        }
        let timestamp = clock::monotonic_secs();

        let gray = if frame.channels() == 1 {
            frame
        } else {
            let mut gray = Mat::default();
            let code = if frame.channels() == 4 {
                imgproc::COLOR_BGRA2GRAY
            } else {
                imgproc::COLOR_BGR2GRAY
            };
            imgproc::cvt_color_def(&frame, &mut gray, code)?;
            gray
        };
        let gray = if gray.is_continuous() { gray } else { gray.try_clone()? };

        let rows = gray.rows() as usize;
        let cols = gray.cols() as usize;
        let data = gray.data_bytes()?;
        let image = Array2::from_shape_vec((rows, cols), data.to_vec())?;
        Ok(Some(TimedFrame {
            frame: image,
            timestamp,
        }))
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut capture) = self.capture.take() {
            capture.release()?;
        }
        Ok(())
    }
}
