//! Playback stream orchestration.
//!
//! A [`PlaybackStream`] ties the pieces together: the unbounded audio ring
//! between the source thread and the device callback, one PLL per thread,
//! the timing hand-off, the latency controller and the resampler. The
//! device-side half (PLL, ring reader, tick producer) is moved into the pull
//! closure and owned by the device thread outright; the source-side half
//! lives in this struct. The two halves share only the stream state and the
//! two SPSC queues.
//!
//! State machine: STOP → SETUP (`playback_start`) → RUN (priming threshold
//! reached in submit) → DRAIN (`playback_stop`) → STOP (device callback
//! observes an empty ring). Restarting or freeing while active goes
//! straight to STOP.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use crossbeam_queue::ArrayQueue;

use crate::config::Tuning;
use crate::convert::Converter;
use crate::device::{AudioBackend, PullFn};
use crate::graph::{GraphId, GraphSink};
use crate::latency::LatencyController;
use crate::pll::{PllClock, PositionAdvance};
use crate::resample::StreamResampler;
use crate::ring::{audio_ring, AudioReader, AudioWriter};
use crate::timing::{timing_channel, DeviceTick, TickReceiver, TickSender};

/// Monotonic nanosecond clock. Injected so tests can drive virtual time.
pub type NanoClock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Process-monotonic nanoseconds.
pub(crate) fn monotonic_clock() -> NanoClock {
    let start = Instant::now();
    Arc::new(move || start.elapsed().as_nanos() as i64)
}

/// Chunk size used to validate resampler construction at stream start; the
/// real chunk is adopted from the first submitted period.
const INITIAL_CHUNK_FRAMES: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Stop = 0,
    Setup = 1,
    Run = 2,
    Drain = 3,
}

impl StreamState {
    pub fn is_active(self) -> bool {
        matches!(self, StreamState::Setup | StreamState::Run)
    }
}

/// Stream state cell shared between the source thread and the device
/// callback.
pub(crate) struct SharedState(AtomicU8);

impl SharedState {
    fn new() -> Self {
        SharedState(AtomicU8::new(StreamState::Setup as u8))
    }

    pub(crate) fn get(&self) -> StreamState {
        match self.0.load(Ordering::Acquire) {
            0 => StreamState::Stop,
            1 => StreamState::Setup,
            2 => StreamState::Run,
            _ => StreamState::Drain,
        }
    }

    pub(crate) fn set(&self, state: StreamState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Build the device-side pull callback.
///
/// Runs on the back-end's realtime thread: wait-free and allocation-free.
/// Per callback: update the device PLL, apply any reader slew, post a timing
/// tick, consume from the ring, and complete DRAIN → STOP once the ring is
/// empty.
fn device_pull(
    shared: Arc<SharedState>,
    mut reader: AudioReader,
    mut ticks: TickSender,
    mut pll: PllClock,
    channels: usize,
    clock: NanoClock,
) -> PullFn {
    Box::new(move |dst: &mut [f32]| {
        let frames = dst.len() / channels;
        if frames == 0 {
            return 0;
        }
        if shared.get() == StreamState::Stop {
            dst.fill(0.0);
            return 0;
        }

        let now = clock();
        let upd = pll.update(now, frames);
        if upd.slew_frames != 0 {
            reader.discard(upd.slew_frames);
        }
        ticks.post(DeviceTick {
            period_frames: pll.period_frames(),
            next_time: pll.next_time(),
            next_position: pll.next_position(),
        });

        let produced = reader.read(&mut dst[..frames * channels]);
        for sample in &mut dst[produced * channels..] {
            *sample = 0.0;
        }

        if shared.get() == StreamState::Drain && reader.len_frames() == 0 {
            shared.set(StreamState::Stop);
        }
        produced
    })
}

/// Source-side half of a playback stream.
pub(crate) struct PlaybackStream {
    shared: Arc<SharedState>,
    writer: AudioWriter,
    ticks: TickReceiver,
    pll: PllClock,
    latency: LatencyController,
    resampler: StreamResampler,
    frames_in: Vec<f32>,
    convert: Converter,
    channels: usize,
    sample_rate: u32,
    stride: usize,
    device_max_period: usize,
    samples: Arc<ArrayQueue<f32>>,
    graph: GraphId,
}

impl PlaybackStream {
    /// Allocate the stream and its device-side pull callback.
    ///
    /// Fails only if the resampler cannot be constructed.
    pub(crate) fn new(
        channels: usize,
        sample_rate: u32,
        convert: Converter,
        tuning: Tuning,
        clock: NanoClock,
    ) -> Result<(Self, PullFn)> {
        let resampler = StreamResampler::new(channels, INITIAL_CHUNK_FRAMES)
            .context("create resampler")?;

        let initial_frames = (sample_rate as f64 * tuning.buffer_seconds) as usize;
        let (writer, reader) = audio_ring(initial_frames, channels);
        let (tick_tx, tick_rx) = timing_channel(tuning.timing_queue_len);
        let shared = Arc::new(SharedState::new());

        let device_pll = PllClock::new(
            sample_rate,
            tuning.pll_bandwidth_hz,
            tuning.slew_threshold_sec,
            PositionAdvance::Consumed,
        );
        let pull = device_pull(
            Arc::clone(&shared),
            reader,
            tick_tx,
            device_pll,
            channels,
            clock,
        );

        let stream = PlaybackStream {
            shared,
            writer,
            ticks: tick_rx,
            pll: PllClock::new(
                sample_rate,
                tuning.pll_bandwidth_hz,
                tuning.slew_threshold_sec,
                PositionAdvance::External,
            ),
            latency: LatencyController::new(sample_rate, &tuning),
            resampler,
            frames_in: Vec::new(),
            convert,
            channels,
            sample_rate,
            stride: channels * 2,
            device_max_period: 0,
            samples: Arc::new(ArrayQueue::new(tuning.latency_sink_len)),
            graph: GraphId(0),
        };
        Ok((stream, pull))
    }

    pub(crate) fn state(&self) -> StreamState {
        self.shared.get()
    }

    /// Initiate a cooperative drain; the device callback finishes it.
    pub(crate) fn begin_drain(&self) {
        self.shared.set(StreamState::Drain);
    }

    /// Immediate stop (restart, free, or fatal error paths).
    pub(crate) fn mark_stopped(&self) {
        self.shared.set(StreamState::Stop);
    }

    pub(crate) fn set_device_max_period(&mut self, frames: usize) {
        self.device_max_period = frames;
    }

    pub(crate) fn latency_samples(&self) -> Arc<ArrayQueue<f32>> {
        Arc::clone(&self.samples)
    }

    pub(crate) fn set_graph(&mut self, graph: GraphId) {
        self.graph = graph;
    }

    pub(crate) fn graph(&self) -> GraphId {
        self.graph
    }

    /// Submit one period of s16le source audio (source thread).
    ///
    /// An error is fatal to the stream; the caller must stop it
    /// immediately. Recoverable trouble (a failed resample period) is
    /// logged and swallowed here.
    pub(crate) fn submit(
        &mut self,
        backend: &mut dyn AudioBackend,
        graph: &dyn GraphSink,
        data: &[u8],
        now: i64,
    ) -> Result<()> {
        if !self.shared.get().is_active() {
            return Ok(());
        }
        let frames = data.len() / self.stride;
        if frames == 0 {
            return Ok(());
        }

        // Scratch and resampler follow the period size; submits normally
        // keep a stable period so this never runs on the hot path.
        if frames != self.pll.period_frames() {
            self.frames_in.resize(frames * self.channels, 0.0);
            self.resampler = StreamResampler::new(self.channels, frames)
                .context("rebuild resampler for new period")?;
        }

        (self.convert)(&data[..frames * self.stride], &mut self.frames_in);

        // Receive timing from the device callback.
        for tick in self.ticks.drain() {
            self.latency.observe_tick(tick);
        }

        let upd = self.pll.update(now, frames);
        if upd.slew_frames != 0 {
            self.writer.append_silence(upd.slew_frames);
        }

        let ratio_upd = self.latency.update(
            upd.cur_time,
            upd.cur_position,
            self.pll.coefficients(),
            self.pll.period_sec(),
            self.device_max_period,
        );

        match self
            .resampler
            .process(&self.frames_in, ratio_upd.ratio, &mut self.writer)
        {
            Ok(generated) => self.pll.add_output_frames(generated),
            Err(e) => {
                // Keep the stream running; a persistent failure surfaces as
                // latency drift and underrun, which the slew path recovers.
                tracing::error!("resampling failed: {e:#}");
                return Ok(());
            }
        }

        if self.shared.get() == StreamState::Setup {
            // The device can request two full buffers immediately at start,
            // and source pacing is at its worst during startup; hold RUN
            // until both are covered.
            let start_frames =
                (self.pll.period_frames() * 2 + self.device_max_period * 2) as i64;
            if self.pll.next_position() >= start_frames {
                backend.playback_start().context("start playback device")?;
                self.shared.set(StreamState::Run);
            }
        }

        let mut latency_frames = ratio_upd.actual_offset;
        if let Some(device) = backend.playback_latency() {
            latency_frames += device as f64;
        }
        let _ = self
            .samples
            .force_push((latency_frames * 1000.0 / self.sample_rate as f64) as f32);
        graph.invalidate(self.graph);

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn debug_offset_error(&self) -> f64 {
        self.latency.offset_error()
    }

    #[cfg(test)]
    pub(crate) fn debug_positions(&self) -> (i64, usize) {
        (self.pll.next_position(), self.writer.len_frames())
    }

    #[cfg(test)]
    pub(crate) fn debug_slew_count(&self) -> u64 {
        self.pll.slew_count()
    }

    #[cfg(test)]
    pub(crate) fn debug_target_latency(&self) -> f64 {
        self.latency.target_latency_frames(self.device_max_period)
    }
}
