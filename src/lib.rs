pub mod camera;
pub mod channel;
pub mod clock;
pub mod config;
pub mod estimator;
pub mod frame;
pub mod logging;
pub mod protocol;
pub mod recorder;
pub mod shm;
pub mod tracker;
