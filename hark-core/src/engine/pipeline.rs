//! Blocking frame loop between the capture ring and the active wake device.
//!
//! ## Stages (per iteration)
//!
//! ```text
//! 1. Drain everything queued in the SPSC ring (f32, capture rate)
//! 2. Resample to the target rate, convert to i16 PCM
//! 3. Accumulate into a RingAudioAccumulator
//! 4. Drop the oldest whole frames if the backlog grew too long
//! 5. Slice frames of the *current* device's frame size
//! 6. Gate on the arbiter; score the frame; on detection notify the
//!    arbiter and broadcast a WakeEvent
//! ```
//!
//! Frames that arrive while the detector is gated are discarded, and the
//! detector's feature history is reset before it scores again, so a phrase
//! heard before the recognizer took over can't fire a second time.
//!
//! The loop runs in `spawn_blocking`; model calls never touch the async
//! executor.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::sync::OnceLock;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    arbiter::ArbiterHandle,
    audio::resample::RateConverter,
    buffering::{f32_to_i16, AudioConsumer, Consumer, RingAudioAccumulator},
    engine::EngineConfig,
    error::Result,
    ipc::events::WakeEvent,
    wake::WakeDeviceRegistry,
};

#[derive(Default)]
pub struct PipelineDiagnostics {
    pub frames_in: AtomicUsize,
    pub samples_resampled: AtomicUsize,
    pub frames_processed: AtomicUsize,
    pub frames_gated: AtomicUsize,
    pub frames_dropped: AtomicUsize,
    pub detections: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.frames_in.store(0, Ordering::Relaxed);
        self.samples_resampled.store(0, Ordering::Relaxed);
        self.frames_processed.store(0, Ordering::Relaxed);
        self.frames_gated.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.detections.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            samples_resampled: self.samples_resampled.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_gated: self.frames_gated.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            detections: self.detections.load(Ordering::Relaxed),
            inference_errors: 0,
            size_mismatches: 0,
        }
    }
}

/// Point-in-time copy of the pipeline counters.
///
/// `inference_errors` and `size_mismatches` come from the active detector and
/// are filled in by [`HarkEngine::diagnostics`](crate::HarkEngine::diagnostics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    /// Raw capture samples popped from the ring.
    pub frames_in: usize,
    pub samples_resampled: usize,
    /// Frames handed to the wake device.
    pub frames_processed: usize,
    /// Frames discarded because the arbiter held the microphone elsewhere.
    pub frames_gated: usize,
    /// Frames dropped by the backlog policy.
    pub frames_dropped: usize,
    pub detections: usize,
    pub inference_errors: u64,
    pub size_mismatches: u64,
}

/// All context the pipeline needs, passed as one struct so the closure stays tidy.
pub struct PipelineContext {
    pub config: EngineConfig,
    pub registry: Arc<WakeDeviceRegistry>,
    pub arbiter: ArbiterHandle,
    pub consumer: AudioConsumer,
    pub running: Arc<AtomicBool>,
    pub wake_tx: broadcast::Sender<WakeEvent>,
    pub seq: Arc<AtomicU64>,
    pub capture_sample_rate: u32,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

/// Samples popped from the capture ring per iteration (20 ms at 48 kHz).
const DRAIN_CHUNK: usize = 960;

const DEFAULT_SLEEP_EMPTY_MS: u64 = 5;

/// Run the blocking pipeline until `ctx.running` becomes false.
///
/// # Errors
/// Returns the first unrecoverable device error, e.g. a frame size mismatch
/// that persisted past the swap tolerance.
pub fn run(mut ctx: PipelineContext) -> Result<()> {
    info!("pipeline started");

    let mut resampler = RateConverter::new(
        ctx.capture_sample_rate,
        ctx.config.target_sample_rate,
        ctx.config.resample_chunk,
    )?;

    let mut raw = vec![0f32; DRAIN_CHUNK];
    let mut resampled: Vec<f32> = Vec::with_capacity(DRAIN_CHUNK);
    let mut pending = RingAudioAccumulator::new(ctx.config.accumulator_capacity);
    let mut frame_index = 0u64;
    // Set while the detector is kept off the microphone; its features go stale.
    let mut held = false;
    let mut result = Ok(());

    'outer: while ctx.running.load(Ordering::Relaxed) {
        // Take everything queued so a slow model shows up as backlog here.
        resampled.clear();
        let mut pulled = 0;
        loop {
            let n = ctx.consumer.pop_slice(&mut raw);
            if n == 0 {
                break;
            }
            pulled += n;
            resampler.process_into(&raw[..n], &mut resampled);
        }
        if pulled == 0 {
            std::thread::sleep(Duration::from_millis(empty_sleep_ms()));
            continue;
        }
        ctx.diagnostics.frames_in.fetch_add(pulled, Ordering::Relaxed);
        if resampled.is_empty() {
            continue;
        }
        ctx.diagnostics
            .samples_resampled
            .fetch_add(resampled.len(), Ordering::Relaxed);
        pending.push(&f32_to_i16(&resampled));

        enforce_backlog(&mut ctx, &mut pending);

        // The arbiter snapshot lags a detection; hold the rest of this batch.
        let mut held_for_batch = false;
        loop {
            // Re-read every frame: a device swap may change the size.
            let device = ctx.registry.current();
            let Some(frame) = pending.drain(device.frame_size()) else {
                break;
            };
            frame_index += 1;

            if held_for_batch || !ctx.arbiter.can_wake_detector_capture() {
                ctx.diagnostics.frames_gated.fetch_add(1, Ordering::Relaxed);
                held = true;
                continue;
            }
            if held {
                device.reset();
                held = false;
                debug!(frame_index, "wake detector resumed with fresh features");
            }

            ctx.diagnostics
                .frames_processed
                .fetch_add(1, Ordering::Relaxed);
            let scored = match device.process_frame_scored(&frame) {
                Ok(scored) => scored,
                Err(e) => {
                    warn!(error = %e, kind = %device.kind(), "wake device failed; stopping pipeline");
                    result = Err(e);
                    break 'outer;
                }
            };

            if scored.detected {
                held_for_batch = true;
                held = true;
                ctx.diagnostics.detections.fetch_add(1, Ordering::Relaxed);
                ctx.arbiter.notify_wake_detected();
                let seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
                let emit = ctx.wake_tx.send(WakeEvent {
                    seq,
                    score: scored.score,
                    frame_index,
                });
                info!(
                    seq,
                    frame_index,
                    score = format_args!("{:.3}", scored.score),
                    delivered = emit.is_ok(),
                    "wake word detected"
                );
            } else if frame_index % 50 == 0 {
                debug!(frame_index, score = scored.score, "wake score");
            }
        }
    }

    let snap = ctx.diagnostics.snapshot();
    info!(
        frames_in = snap.frames_in,
        samples_resampled = snap.samples_resampled,
        frames_processed = snap.frames_processed,
        frames_gated = snap.frames_gated,
        frames_dropped = snap.frames_dropped,
        detections = snap.detections,
        "pipeline stopped"
    );
    result
}

/// Keep at most `max_backlog_frames` whole frames queued; older audio is
/// worthless for wake detection once the loop has fallen behind.
fn enforce_backlog(ctx: &mut PipelineContext, pending: &mut RingAudioAccumulator) {
    let frame_size = ctx.registry.frame_size().max(1);
    let backlog = pending.len() / frame_size;
    if backlog <= ctx.config.max_backlog_frames {
        return;
    }
    let excess = backlog - ctx.config.max_backlog_frames;
    pending.discard(excess * frame_size);
    ctx.diagnostics
        .frames_dropped
        .fetch_add(excess, Ordering::Relaxed);
    warn!(
        dropped = excess,
        kept = ctx.config.max_backlog_frames,
        "wake pipeline fell behind; dropping oldest frames"
    );
}

fn empty_sleep_ms() -> u64 {
    static EMPTY_SLEEP_MS: OnceLock<u64> = OnceLock::new();
    *EMPTY_SLEEP_MS.get_or_init(|| {
        std::env::var("HARK_PIPELINE_EMPTY_SLEEP_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(1, 20))
            .unwrap_or(DEFAULT_SLEEP_EMPTY_MS)
    })
}
