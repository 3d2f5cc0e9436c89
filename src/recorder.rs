use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const HEADER: &str = "t,delta_angle,vigor,bias";

/// CSV log of received tail samples and the estimate at that moment.
///
/// `t` is relative to the first recorded sample.
pub struct SwimRecorder {
    path: PathBuf,
    writer: BufWriter<File>,
    t0: Option<f64>,
    rows: usize,
    flush_every: usize,
}

impl SwimRecorder {
    /// `path` が既存ディレクトリなら `swim_<YYYYmmdd_HHMMSS>.csv` をその中に作る
    pub fn create(path: &Path, flush_every: usize) -> Result<Self> {
        let path = if path.is_dir() {
            let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
            path.join(format!("swim_{}.csv", ts))
        } else {
            path.to_path_buf()
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let file = File::create(&path)
            .with_context(|| format!("failed to create recording {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", HEADER)?;
        Ok(Self {
            path,
            writer,
            t0: None,
            rows: 0,
            flush_every: flush_every.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn record(&mut self, timestamp: f64, delta_angle: f64, vigor: f64, bias: f64) -> Result<()> {
        let t0 = *self.t0.get_or_insert(timestamp);
        writeln!(
            self.writer,
            "{:.6},{:.6},{:.6},{:.6}",
            timestamp - t0,
            delta_angle,
            vigor,
            bias
        )?;
        self.rows += 1;
        if self.rows % self.flush_every == 0 {
            self.writer.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for SwimRecorder {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}
