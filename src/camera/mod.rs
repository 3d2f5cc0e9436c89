mod acquisition;
#[cfg(feature = "camera")]
mod capture;
mod source;
mod synthetic;

pub use acquisition::{run_acquisition, AcquisitionStats};
#[cfg(feature = "camera")]
pub use capture::OpenCvSource;
pub use source::{FrameSource, NoiseSource, SceneSpec, SourceSpec, TimedFrame};
pub use synthetic::{bend_at, SyntheticTailSource, TailScene};
