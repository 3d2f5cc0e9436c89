use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::preprocess::preprocess;
use super::tail::{track_tail, TailTrace};
use crate::channel::{AngleHost, ConnectionEvent};
use crate::config::TrackerParams;
use crate::frame::Frame;
use crate::protocol::AngleSample;
use crate::shm::{
    AngleHistory, ControlBlock, FrameSlot, ParamMailbox, Region, SegmentBuffer, ShmLayout,
    TimestampQueue,
};

#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    /// Upper bound for one explicitly requested accept
    pub accept_timeout: Duration,
    /// Sleep when there is no timestamp to process
    pub poll_interval: Duration,
    /// Per-frame timing at debug level
    pub verbose: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            accept_timeout: Duration::from_millis(2000),
            poll_interval: Duration::from_micros(200),
            verbose: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrackingStats {
    pub frames: u64,
    pub empty_traces: u64,
    pub missing_frames: u64,
    pub samples_sent: u64,
    pub param_updates: u64,
    pub rejected_params: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// No timestamp was queued
    Idle,
    /// A timestamp was popped but the raw frame region held no usable frame
    NoFrame,
    /// Frame tracked; the deflection if the chain produced any segment
    Tracked(Option<f64>),
}

/// The tracking process: consumes timestamps, tracks the latest raw frame,
/// publishes results to shared memory and streams the deflection to the
/// downstream peer.
pub struct TrackingWorker {
    raw: FrameSlot,
    processed: FrameSlot,
    segments: SegmentBuffer,
    history: AngleHistory,
    queue: TimestampQueue,
    mailbox: ParamMailbox,
    control: ControlBlock,
    host: AngleHost,
    events: Receiver<ConnectionEvent>,
    params: TrackerParams,
    options: WorkerOptions,
    stats: TrackingStats,
}

impl TrackingWorker {
    /// Attaches every region the tracker touches. Any missing region is a
    /// startup-ordering error and aborts the worker.
    pub fn attach(
        layout: &ShmLayout,
        mut host: AngleHost,
        params: TrackerParams,
        options: WorkerOptions,
    ) -> Result<Self> {
        let history = AngleHistory::attach(layout)?;
        params
            .validate(history.capacity())
            .context("initial tracking parameters")?;
        let events = host.subscribe();
        Ok(Self {
            raw: FrameSlot::attach(layout, Region::RawFrame)?,
            processed: FrameSlot::attach(layout, Region::ProcessedFrame)?,
            segments: SegmentBuffer::attach(layout)?,
            history,
            queue: TimestampQueue::attach(layout)?,
            mailbox: ParamMailbox::attach(layout)?,
            control: ControlBlock::attach(layout)?,
            host,
            events,
            params,
            options,
            stats: TrackingStats::default(),
        })
    }

    pub fn params(&self) -> &TrackerParams {
        &self.params
    }

    pub fn stats(&self) -> TrackingStats {
        self.stats
    }

    pub fn host(&self) -> &AngleHost {
        &self.host
    }

    /// One loop iteration: connection request, parameter update, then at
    /// most one timestamp.
    pub fn step(&mut self) -> Result<StepOutcome> {
        self.sync_connection_state();

        if self.control.take_connection_request() && !self.host.is_connected() {
            info!("connection requested, waiting for downstream peer");
            if let Err(e) = self.host.accept_within(self.options.accept_timeout) {
                warn!(error = %format!("{:#}", e), "accept failed");
            }
            self.sync_connection_state();
        }

        self.receive_parameters();

        let Some(timestamp) = self.queue.try_pop() else {
            return Ok(StepOutcome::Idle);
        };
        let raw = match self.raw.read() {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.stats.missing_frames += 1;
                return Ok(StepOutcome::NoFrame);
            }
            Err(e) => {
                debug!(error = %e, "raw frame unreadable");
                self.stats.missing_frames += 1;
                return Ok(StepOutcome::NoFrame);
            }
        };

        let started = Instant::now();
        let (processed, trace) = track_frame(&raw, &self.params)?;
        let deflection = trace.deflection();

        if let Some(delta_angle) = deflection {
            match self.host.send(&AngleSample { timestamp, delta_angle }) {
                Ok(true) => self.stats.samples_sent += 1,
                Ok(false) => {}
                Err(e) => warn!(error = %format!("{:#}", e), "dropping downstream connection"),
            }
            self.sync_connection_state();
        } else {
            self.stats.empty_traces += 1;
        }

        if let Err(e) = self.processed.write(processed.view()) {
            debug!(error = %e, "processed frame not published");
        }
        self.segments.write(&trace.positions)?;
        if let Some(delta_angle) = deflection {
            self.history.push(delta_angle, timestamp)?;
        }

        self.stats.frames += 1;
        self.control.add_frames_tracked(1);
        if self.options.verbose {
            debug!(
                timestamp,
                segments = trace.segments(),
                elapsed_us = started.elapsed().as_micros() as u64,
                "tracked"
            );
        }
        Ok(StepOutcome::Tracked(deflection))
    }

    /// Runs until the shared shutdown flag or `interrupt` is set. Teardown
    /// detaches every region first, then closes the downstream connection
    /// and the listening socket.
    pub fn run(mut self, interrupt: &AtomicBool) -> Result<TrackingStats> {
        info!(params = ?self.params, "tracking started");
        while !self.control.shutdown_requested() && !interrupt.load(Ordering::Relaxed) {
            if self.step()? == StepOutcome::Idle {
                std::thread::sleep(self.options.poll_interval);
            }
        }

        let Self {
            raw,
            processed,
            segments,
            history,
            queue,
            mailbox,
            control,
            mut host,
            events,
            stats,
            ..
        } = self;
        control.set_connected(false);
        drop((raw, processed, segments, history, queue, mailbox, control));
        host.close();
        drop((host, events));
        info!(
            frames = stats.frames,
            sent = stats.samples_sent,
            empty = stats.empty_traces,
            "tracking stopped"
        );
        Ok(stats)
    }

    fn receive_parameters(&mut self) {
        match self.mailbox.take_update() {
            Ok(Some(params)) => match params.validate(self.history.capacity()) {
                Ok(()) => {
                    if params != self.params {
                        info!(?params, "tracking parameters updated");
                    }
                    self.params = params;
                    self.stats.param_updates += 1;
                }
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "rejected tracking parameters");
                    self.stats.rejected_params += 1;
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(error = %format!("{:#}", e), "unreadable tracking parameters");
                self.stats.rejected_params += 1;
            }
        }
    }

    /// Mirrors channel events into the shared control block.
    fn sync_connection_state(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                ConnectionEvent::Connected(_) => self.control.set_connected(true),
                ConnectionEvent::Lost => {
                    self.control.set_connected(false);
                    self.control.raise_connection_lost();
                }
            }
        }
    }
}

/// Preprocessing and tail tracking for one raw frame.
pub fn track_frame(raw: &Frame, params: &TrackerParams) -> Result<(Frame, TailTrace)> {
    let processed = preprocess(raw.view(), params).context("preprocessing failed")?;
    let trace = track_tail(
        processed.view(),
        params.base(),
        params.tip(),
        params.n_segments,
        params.search_area,
    );
    Ok((processed, trace))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{SceneSpec, TailScene};
    use crate::channel::AngleReceiver;
    use crate::shm::{test_layout, RegionSet};
    use std::sync::Arc;

    struct Rig {
        _dir: tempfile::TempDir,
        owner: RegionSet,
        worker: TrackingWorker,
    }

    fn params(layout: &ShmLayout) -> TrackerParams {
        TrackerParams {
            angle_trace_length: layout.trace_length,
            ..TrackerParams::default()
        }
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let layout = test_layout(dir.path());
        let owner = RegionSet::create_all(&layout).unwrap();
        let host = AngleHost::bind("127.0.0.1:0").unwrap();
        let options = WorkerOptions {
            accept_timeout: Duration::from_millis(500),
            ..WorkerOptions::default()
        };
        let worker = TrackingWorker::attach(&layout, host, params(&layout), options).unwrap();
        Rig { _dir: dir, owner, worker }
    }

    fn straight_tail() -> Frame {
        TailScene::new(128, 128, SceneSpec::default()).render(0.0)
    }

    #[test]
    fn test_attach_requires_regions() {
        let dir = tempfile::tempdir().unwrap();
        let layout = test_layout(dir.path());
        let host = AngleHost::bind("127.0.0.1:0").unwrap();
        let err = TrackingWorker::attach(&layout, host, params(&layout), WorkerOptions::default())
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("not found"));
    }

    #[test]
    fn test_idle_and_missing_frame() {
        let mut rig = rig();
        assert_eq!(rig.worker.step().unwrap(), StepOutcome::Idle);
        rig.owner.queue.try_push(1.0);
        assert_eq!(rig.worker.step().unwrap(), StepOutcome::NoFrame);
        assert!(rig.owner.history.samples().unwrap().is_empty());
    }

    #[test]
    fn test_tracks_and_publishes() {
        let mut rig = rig();
        rig.owner.raw_frame.write(straight_tail().view()).unwrap();
        rig.owner.queue.try_push(3.5);

        let StepOutcome::Tracked(Some(deflection)) = rig.worker.step().unwrap() else {
            panic!("expected a tracked frame");
        };
        assert!(deflection.abs() < 0.05, "deflection={}", deflection);

        let segments = rig.owner.segments.read().unwrap();
        assert_eq!(segments.len(), 8);
        assert_eq!(segments[0], (10.0, 10.0));
        assert_eq!(rig.owner.history.slot(0).unwrap(), (deflection, 3.5));
        let processed = rig.owner.processed_frame.read().unwrap().unwrap();
        assert_eq!(processed.dim(), (128, 128));
        // 反転済み: 尾が明るい
        assert!(processed[[55, 55]] > processed[[10, 100]]);
        assert_eq!(rig.owner.control.frames_tracked(), 1);
    }

    #[test]
    fn test_empty_trace_leaves_history_alone() {
        let mut rig = rig();
        // 反転すると全画素 0
        rig.owner.raw_frame.write(Frame::from_elem((64, 64), 255).view()).unwrap();
        rig.owner.queue.try_push(1.0);
        assert_eq!(rig.worker.step().unwrap(), StepOutcome::Tracked(None));
        assert!(rig.owner.history.samples().unwrap().is_empty());
        assert_eq!(rig.owner.segments.read().unwrap(), vec![(10.0, 10.0)]);
        assert_eq!(rig.worker.stats().empty_traces, 1);
    }

    #[test]
    fn test_parameter_snapshot_replaced_or_rejected() {
        let mut rig = rig();
        let mut update = rig.worker.params().clone();
        update.n_segments = 3;
        rig.owner.params.publish(&update).unwrap();
        rig.worker.step().unwrap();
        assert_eq!(rig.worker.params().n_segments, 3);

        let mut bad = update.clone();
        bad.angle_trace_length += 1;
        bad.n_segments = 5;
        rig.owner.params.publish(&bad).unwrap();
        rig.worker.step().unwrap();
        assert_eq!(rig.worker.params().n_segments, 3);
        assert_eq!(rig.worker.stats().rejected_params, 1);

        // 巨大なフィルタサイズは弾かれ、追跡は続く
        let mut oversized = update.clone();
        oversized.filter_size = 5000;
        rig.owner.params.publish(&oversized).unwrap();
        rig.owner.raw_frame.write(straight_tail().view()).unwrap();
        rig.owner.queue.try_push(1.0);
        assert!(matches!(rig.worker.step().unwrap(), StepOutcome::Tracked(Some(_))));
        assert_eq!(rig.worker.params().filter_size, update.filter_size);
        assert_eq!(rig.worker.stats().rejected_params, 2);
    }

    #[test]
    fn test_requested_connection_streams_samples() {
        let mut rig = rig();
        let addr = rig.worker.host().local_addr().unwrap();
        let mut receiver = AngleReceiver::new(addr.to_string(), Duration::from_secs(1)).unwrap();
        assert!(receiver.open_connection());

        // 要求がなければ accept しない
        rig.worker.step().unwrap();
        assert!(!rig.owner.control.is_connected());

        rig.owner.control.request_connection();
        rig.worker.step().unwrap();
        assert!(rig.owner.control.is_connected());
        assert!(!rig.owner.control.connection_requested());

        rig.owner.raw_frame.write(straight_tail().view()).unwrap();
        rig.owner.queue.try_push(7.25);
        rig.worker.step().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut got = Vec::new();
        while got.is_empty() && Instant::now() < deadline {
            got = receiver.read_data();
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].timestamp, 7.25);
        assert_eq!(rig.worker.stats().samples_sent, 1);
    }

    #[test]
    fn test_failed_request_raises_connection_lost() {
        let mut rig = rig();
        rig.owner.control.request_connection();
        rig.worker.step().unwrap();
        assert!(!rig.owner.control.is_connected());
        assert!(rig.owner.control.take_connection_lost());
        assert!(!rig.owner.control.take_connection_lost());
        // 次の要求が来るまで再試行しない
        let started = Instant::now();
        rig.worker.step().unwrap();
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn test_send_failure_raises_connection_lost_once() {
        let mut rig = rig();
        let addr = rig.worker.host().local_addr().unwrap();
        let mut receiver = AngleReceiver::new(addr.to_string(), Duration::from_secs(1)).unwrap();
        assert!(receiver.open_connection());
        rig.owner.control.request_connection();
        rig.worker.step().unwrap();
        assert!(rig.owner.control.is_connected());

        drop(receiver);
        std::thread::sleep(Duration::from_millis(50));
        rig.owner.raw_frame.write(straight_tail().view()).unwrap();
        rig.owner.queue.try_push(2.0);
        assert!(matches!(rig.worker.step().unwrap(), StepOutcome::Tracked(Some(_))));

        assert!(!rig.owner.control.is_connected());
        assert!(!rig.worker.host().is_connected());
        assert!(rig.owner.control.take_connection_lost());
        assert!(!rig.owner.control.take_connection_lost());
        assert_eq!(rig.worker.stats().samples_sent, 0);
        // 送れなくても履歴には残る
        assert_eq!(rig.owner.history.samples().unwrap().len(), 1);

        // 要求が来るまで accept し直さない
        rig.owner.queue.try_push(3.0);
        rig.worker.step().unwrap();
        assert!(!rig.worker.host().is_connected());
        assert!(!rig.owner.control.is_connected());
        assert!(!rig.owner.control.take_connection_lost());
    }

    #[test]
    fn test_run_stops_on_shutdown() {
        let Rig { _dir, owner, worker } = rig();
        let handle = std::thread::spawn(move || worker.run(&AtomicBool::new(false)).unwrap());

        // 生フレーム未書き込みのタイムスタンプは読み捨てられる
        for i in 1..=5 {
            owner.queue.try_push(i as f64);
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while !owner.queue.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        owner.control.request_shutdown();
        let stats = handle.join().unwrap();
        assert_eq!(stats.missing_frames, 5);
        assert!(!owner.control.is_connected());
    }

    #[test]
    fn test_run_stops_on_interrupt() {
        let Rig { _dir, owner, worker } = rig();
        let interrupt = Arc::new(AtomicBool::new(false));
        let flag = interrupt.clone();
        let handle = std::thread::spawn(move || worker.run(&flag).unwrap());
        std::thread::sleep(Duration::from_millis(20));
        interrupt.store(true, Ordering::Relaxed);
        assert_eq!(handle.join().unwrap().frames, 0);
        assert!(!owner.control.shutdown_requested());
    }
}
