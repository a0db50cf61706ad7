//! Frame acquisition loop.
//!
//! Two strategies feed the same [`FramePipeline`]:
//!
//! - **Cooperative**: one tokio task awaits the source's frames and runs
//!   the pipeline inline.
//! - **Threaded poll**: a dedicated OS thread does blocking reads into a
//!   [`LatestSlot`]; a tokio task polls the slot and runs the pipeline. A
//!   slow consumer loses intermediate frames instead of queueing them.
//!
//! Stopping is cooperative: the producer thread sees a flag, the consumer
//! task is cancelled, and the thread is joined with a bounded wait.

use crate::pipeline::{FrameOutcome, FramePipeline};
use crate::slot::LatestSlot;
use crate::stats::{AcquisitionStats, StatsSnapshot};
use ftcam_hw::{AsyncFrameSource, CameraError, FrameSource, RawFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Cooperative,
    ThreadedPoll,
}

impl CaptureMode {
    /// Cooperative where the runtime can watch the device for readiness.
    pub fn for_platform() -> Self {
        if cfg!(target_os = "linux") {
            Self::Cooperative
        } else {
            Self::ThreadedPoll
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Cooperative => "cooperative",
            Self::ThreadedPoll => "threaded",
        }
    }
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("acquisition stream state: {0}")]
    StreamState(String),
    #[error(transparent)]
    Camera(#[from] CameraError),
}

#[derive(Debug, Clone)]
pub struct AcquisitionOptions {
    /// Consumer backoff while the slot is empty (threaded poll only).
    pub poll_interval: Duration,
    /// How long `stop` waits for the capture thread before detaching it.
    pub join_timeout: Duration,
    /// Parent span for the loop's logs. Defaults to the current span.
    pub span: Option<Span>,
}

impl Default for AcquisitionOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            join_timeout: Duration::from_secs(1),
            span: None,
        }
    }
}

/// A running acquisition loop.
///
/// Must be started from within a tokio runtime. Dropping it stops the loop
/// without waiting for the capture thread.
pub struct Acquisition {
    mode: CaptureMode,
    task: Option<JoinHandle<Result<(), AcquisitionError>>>,
    producer: Option<std::thread::JoinHandle<Result<(), CameraError>>>,
    stop: Arc<AtomicBool>,
    stats: Arc<AcquisitionStats>,
    join_timeout: Duration,
    span: Span,
}

impl Acquisition {
    /// Start with `mode`, for sources that support both strategies.
    pub fn start<S>(
        mode: CaptureMode,
        source: S,
        pipeline: FramePipeline,
        options: AcquisitionOptions,
    ) -> Result<Self, AcquisitionError>
    where
        S: FrameSource + AsyncFrameSource + 'static,
    {
        match mode {
            CaptureMode::Cooperative => Ok(Self::start_cooperative(source, pipeline, options)),
            CaptureMode::ThreadedPoll => Self::start_threaded(source, pipeline, options),
        }
    }

    pub fn start_cooperative<S>(source: S, pipeline: FramePipeline, options: AcquisitionOptions) -> Self
    where
        S: AsyncFrameSource + 'static,
    {
        let mut acq = Self::new(CaptureMode::Cooperative, &options);
        let task = run_cooperative(
            source,
            pipeline,
            Arc::clone(&acq.stats),
            Arc::clone(&acq.stop),
        );
        acq.task = Some(tokio::spawn(task.instrument(acq.span.clone())));
        acq
    }

    pub fn start_threaded<S>(
        source: S,
        pipeline: FramePipeline,
        options: AcquisitionOptions,
    ) -> Result<Self, AcquisitionError>
    where
        S: FrameSource + 'static,
    {
        let mut acq = Self::new(CaptureMode::ThreadedPoll, &options);
        let slot = Arc::new(LatestSlot::new());
        let done = Arc::new(AtomicBool::new(false));

        let producer = {
            let slot = Arc::clone(&slot);
            let done = Arc::clone(&done);
            let stats = Arc::clone(&acq.stats);
            let stop = Arc::clone(&acq.stop);
            let span = acq.span.clone();
            std::thread::Builder::new()
                .name("ftcam-capture".into())
                .spawn(move || {
                    let _enter = span.enter();
                    let result = run_producer(source, &slot, &stats, &stop);
                    done.store(true, Ordering::Release);
                    result
                })
                .map_err(|e| {
                    AcquisitionError::StreamState(format!("failed to spawn capture thread: {e}"))
                })?
        };
        acq.producer = Some(producer);

        let task = run_consumer(
            slot,
            pipeline,
            Arc::clone(&acq.stats),
            Arc::clone(&acq.stop),
            done,
            options.poll_interval,
        );
        acq.task = Some(tokio::spawn(task.instrument(acq.span.clone())));
        Ok(acq)
    }

    fn new(mode: CaptureMode, options: &AcquisitionOptions) -> Self {
        let parent = options.span.clone().unwrap_or_else(Span::current);
        let span = tracing::info_span!(parent: &parent, "acquisition", mode = mode.as_str());
        tracing::info!(parent: &span, "starting acquisition");
        Self {
            mode,
            task: None,
            producer: None,
            stop: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(AcquisitionStats::default()),
            join_timeout: options.join_timeout,
            span,
        }
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Shared counters, readable after the loop is gone.
    pub fn stats_handle(&self) -> Arc<AcquisitionStats> {
        Arc::clone(&self.stats)
    }

    /// Whether the loop has ended on its own (source exhausted, consumer
    /// stop or error).
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the loop to end on its own.
    pub async fn wait(mut self) -> Result<(), AcquisitionError> {
        let result = self.join_task().await;
        self.stop.store(true, Ordering::Release);
        let producer = self.join_producer().await;
        tracing::info!(parent: &self.span, stats = ?self.stats.snapshot(), "acquisition finished");
        result.and(producer)
    }

    /// Stop the loop. Cancellation is not an error; a failure the loop hit
    /// before being stopped is returned.
    pub async fn stop(mut self) -> Result<(), AcquisitionError> {
        self.stop.store(true, Ordering::Release);
        if let Some(task) = &self.task {
            task.abort();
        }
        let result = self.join_task().await;
        let producer = self.join_producer().await;
        tracing::info!(parent: &self.span, stats = ?self.stats.snapshot(), "acquisition stopped");
        result.and(producer)
    }

    async fn join_task(&mut self) -> Result<(), AcquisitionError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(AcquisitionError::StreamState(format!(
                "acquisition task failed: {e}"
            ))),
        }
    }

    /// Join the capture thread, giving up after `join_timeout`.
    async fn join_producer(&mut self) -> Result<(), AcquisitionError> {
        let Some(handle) = self.producer.take() else {
            return Ok(());
        };
        let deadline = Instant::now() + self.join_timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!(
                    parent: &self.span,
                    timeout_ms = self.join_timeout.as_millis() as u64,
                    "capture thread did not exit; detaching"
                );
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        match handle.join() {
            Ok(result) => result.map_err(AcquisitionError::from),
            Err(_) => Err(AcquisitionError::StreamState("capture thread panicked".into())),
        }
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn process(pipeline: &mut FramePipeline, stats: &AcquisitionStats, raw: &RawFrame) -> FrameOutcome {
    let outcome = pipeline.process(raw);
    stats.record(outcome);
    outcome
}

async fn run_cooperative<S: AsyncFrameSource>(
    mut source: S,
    mut pipeline: FramePipeline,
    stats: Arc<AcquisitionStats>,
    stop: Arc<AtomicBool>,
) -> Result<(), AcquisitionError> {
    while !stop.load(Ordering::Acquire) {
        let raw = match source.next_frame().await {
            Ok(Some(raw)) => raw,
            Ok(None) | Err(CameraError::Closed) => {
                tracing::info!("source ended");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "capture failed");
                return Err(e.into());
            }
        };
        stats.record_captured();
        if process(&mut pipeline, &stats, &raw) == FrameOutcome::Stop {
            break;
        }
    }
    Ok(())
}

fn run_producer<S: FrameSource>(
    mut source: S,
    slot: &LatestSlot<RawFrame>,
    stats: &AcquisitionStats,
    stop: &AtomicBool,
) -> Result<(), CameraError> {
    tracing::debug!("capture thread started");
    while !stop.load(Ordering::Acquire) {
        match source.read_frame() {
            Ok(Some(raw)) => {
                stats.record_captured();
                if slot.put(raw).is_some() {
                    stats.record_dropped();
                }
            }
            Ok(None) => {}
            Err(CameraError::Closed) => {
                tracing::info!("source ended");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "capture thread stopped");
                return Err(e);
            }
        }
    }
    tracing::debug!("capture thread exiting");
    Ok(())
}

async fn run_consumer(
    slot: Arc<LatestSlot<RawFrame>>,
    mut pipeline: FramePipeline,
    stats: Arc<AcquisitionStats>,
    stop: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
    poll_interval: Duration,
) -> Result<(), AcquisitionError> {
    loop {
        if let Some(raw) = slot.take() {
            if process(&mut pipeline, &stats, &raw) == FrameOutcome::Stop {
                stop.store(true, Ordering::Release);
                break;
            }
            tokio::task::yield_now().await;
            continue;
        }
        if done.load(Ordering::Acquire) {
            // The producer may have stored a last frame after the take above.
            if let Some(raw) = slot.take() {
                process(&mut pipeline, &stats, &raw);
            }
            break;
        }
        tokio::time::sleep(poll_interval).await;
    }
    Ok(())
}
