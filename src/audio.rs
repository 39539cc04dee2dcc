//! Public audio façade.
//!
//! [`AudioSystem`] owns the selected back-end and at most one playback
//! stream plus the record pass-through. All operations are called from the
//! source thread and take `&self`; the inner mutex is never touched by the
//! device callback, so the hot paths stay wait-free.
//!
//! Error policy: nothing propagates to the source protocol. Failures are
//! logged, the affected stream is stopped, and retained volume/mute survive
//! for the next stream.

use std::sync::{Arc, Mutex};

use crate::config::Tuning;
use crate::convert::{converter_for, SourceFormat};
use crate::device::{select_backend, AudioBackend, PushFn};
use crate::engine::{monotonic_clock, NanoClock, PlaybackStream, StreamState};
use crate::graph::{latency_graph_title, GraphSink};

/// Consumer of captured audio (the source protocol's record direction).
pub trait CaptureSink: Send + Sync {
    /// Forward `data` (interleaved s16le) captured at `time`.
    fn write_audio(&self, data: &[u8], time: u32);
}

/// Sink for hosts that never record.
pub struct NullCaptureSink;

impl CaptureSink for NullCaptureSink {
    fn write_audio(&self, _data: &[u8], _time: u32) {}
}

const MAX_VOLUME_CHANNELS: usize = 8;

struct PlaybackCtl {
    volume: [u16; MAX_VOLUME_CHANNELS],
    volume_channels: usize,
    mute: bool,
    stream: Option<PlaybackStream>,
}

struct RecordCtl {
    started: bool,
    channels: usize,
    sample_rate: u32,
    volume: [u16; MAX_VOLUME_CHANNELS],
    volume_channels: usize,
    mute: bool,
}

struct Inner {
    backend: Option<Box<dyn AudioBackend>>,
    playback: PlaybackCtl,
    record: RecordCtl,
    tuning: Tuning,
}

/// Process-wide audio bridge state.
pub struct AudioSystem {
    inner: Mutex<Inner>,
    graph: Arc<dyn GraphSink>,
    capture: Arc<dyn CaptureSink>,
    clock: NanoClock,
}

impl AudioSystem {
    /// Select the first working back-end from `backends` and build the
    /// system around it. With no working back-end every operation becomes a
    /// no-op and `supports_*` report false.
    pub fn init(
        backends: Vec<Box<dyn AudioBackend>>,
        capture: Arc<dyn CaptureSink>,
        graph: Arc<dyn GraphSink>,
    ) -> Self {
        Self::init_with(backends, capture, graph, Tuning::default(), monotonic_clock())
    }

    /// [`AudioSystem::init`] with explicit tuning and clock.
    pub fn init_with(
        backends: Vec<Box<dyn AudioBackend>>,
        capture: Arc<dyn CaptureSink>,
        graph: Arc<dyn GraphSink>,
        tuning: Tuning,
        clock: NanoClock,
    ) -> Self {
        AudioSystem {
            inner: Mutex::new(Inner {
                backend: select_backend(backends),
                playback: PlaybackCtl {
                    volume: [0; MAX_VOLUME_CHANNELS],
                    volume_channels: 0,
                    mute: false,
                    stream: None,
                },
                record: RecordCtl {
                    started: false,
                    channels: 0,
                    sample_rate: 0,
                    volume: [0; MAX_VOLUME_CHANNELS],
                    volume_channels: 0,
                    mute: false,
                },
                tuning,
            }),
            graph,
            capture,
            clock,
        }
    }

    /// Stop both directions immediately (no drain) and release the
    /// back-end.
    pub fn free(&self) {
        let Ok(mut guard) = self.inner.lock() else {
            return;
        };
        let inner = &mut *guard;
        let Some(backend) = inner.backend.as_mut() else {
            return;
        };
        Self::teardown_playback(backend.as_mut(), &mut inner.playback, &*self.graph);
        if inner.record.started {
            backend.record_stop();
            inner.record.started = false;
        }
        // The back-end goes last, after both directions are down.
        inner.backend = None;
    }

    pub fn supports_playback(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .backend
            .as_ref()
            .is_some_and(|b| b.supports_playback())
    }

    pub fn supports_record(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .backend
            .as_ref()
            .is_some_and(|b| b.supports_record())
    }

    /// Begin a playback stream in SETUP.
    ///
    /// A stream that is still active is stopped immediately first: even if
    /// the format were compatible, there may not be enough buffered data
    /// left to avoid underrunning.
    pub fn playback_start(
        &self,
        channels: usize,
        sample_rate: u32,
        format: SourceFormat,
        _time: u32,
    ) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let Some(backend) = inner.backend.as_mut() else {
            return;
        };
        if !backend.supports_playback() {
            return;
        }

        if inner.playback.stream.is_some() {
            Self::teardown_playback(backend.as_mut(), &mut inner.playback, &*self.graph);
        }

        let Some(convert) = converter_for(format) else {
            tracing::warn!(?format, "unsupported playback format");
            return;
        };

        let (mut stream, pull) = match PlaybackStream::new(
            channels,
            sample_rate,
            convert,
            inner.tuning,
            Arc::clone(&self.clock),
        ) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!("failed to create playback stream: {e:#}");
                return;
            }
        };

        let max_period = match backend.playback_setup(channels, sample_rate, pull) {
            Ok(frames) if frames > 0 => frames,
            Ok(_) => {
                tracing::error!("backend reported a zero maximum period");
                backend.playback_stop();
                return;
            }
            Err(e) => {
                tracing::error!("playback setup failed: {e:#}");
                return;
            }
        };
        stream.set_device_max_period(max_period);

        // Restore retained volume and mute before any data flows.
        if inner.playback.volume_channels > 0 {
            backend.playback_volume(&inner.playback.volume[..inner.playback.volume_channels]);
        }
        backend.playback_mute(inner.playback.mute);

        let graph_id = self.graph.register(
            "PLAYBACK",
            stream.latency_samples(),
            inner.tuning.graph_range_ms.0,
            inner.tuning.graph_range_ms.1,
            latency_graph_title,
        );
        stream.set_graph(graph_id);

        tracing::info!(channels, rate_hz = sample_rate, max_period, "playback setup");
        inner.playback.stream = Some(stream);
    }

    /// Initiate a cooperative drain; the device callback completes it once
    /// the ring runs dry.
    pub fn playback_stop(&self) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let Some(backend) = inner.backend.as_mut() else {
            return;
        };
        let Some(stream) = inner.playback.stream.as_ref() else {
            return;
        };
        if stream.state() == StreamState::Stop {
            // A previous drain already completed on the device thread;
            // release the resources now.
            Self::teardown_playback(backend.as_mut(), &mut inner.playback, &*self.graph);
            return;
        }
        stream.begin_drain();
    }

    /// Submit one burst of source audio. `data` must be a whole number of
    /// frames in the format given to `playback_start`.
    pub fn playback_data(&self, data: &[u8]) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let Some(backend) = inner.backend.as_mut() else {
            return;
        };
        let state = match inner.playback.stream.as_ref() {
            Some(stream) => stream.state(),
            None => return,
        };
        if state == StreamState::Stop {
            // Drain finished on the device thread since the last call.
            Self::teardown_playback(backend.as_mut(), &mut inner.playback, &*self.graph);
            return;
        }
        if !state.is_active() {
            return;
        }

        let now = (self.clock)();
        let result = inner
            .playback
            .stream
            .as_mut()
            .expect("stream checked above")
            .submit(backend.as_mut(), &*self.graph, data, now);
        if let Err(e) = result {
            tracing::error!("playback stream failed: {e:#}");
            Self::teardown_playback(backend.as_mut(), &mut inner.playback, &*self.graph);
        }
    }

    /// Set per-channel playback volume (at most 8 channels). Retained
    /// across stream restarts and re-applied during SETUP.
    pub fn playback_volume(&self, volume: &[u16]) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let Some(backend) = inner.backend.as_mut() else {
            return;
        };
        let channels = volume.len().min(MAX_VOLUME_CHANNELS);
        inner.playback.volume[..channels].copy_from_slice(&volume[..channels]);
        inner.playback.volume_channels = channels;

        if stream_is_active(&inner.playback.stream) {
            backend.playback_volume(&inner.playback.volume[..channels]);
        }
    }

    /// Set playback mute. Retained across stream restarts.
    pub fn playback_mute(&self, mute: bool) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let Some(backend) = inner.backend.as_mut() else {
            return;
        };
        inner.playback.mute = mute;
        if stream_is_active(&inner.playback.stream) {
            backend.playback_mute(mute);
        }
    }

    /// Start (or restart) the record pass-through. Same parameters while
    /// already started is a no-op; changed parameters restart the device.
    pub fn record_start(&self, channels: usize, sample_rate: u32, format: SourceFormat) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let Some(backend) = inner.backend.as_mut() else {
            return;
        };
        if !backend.supports_record() {
            return;
        }
        if format != SourceFormat::S16Le {
            tracing::warn!(?format, "unsupported record format");
            return;
        }

        if inner.record.started {
            if channels == inner.record.channels && sample_rate == inner.record.sample_rate {
                return;
            }
            backend.record_stop();
            inner.record.started = false;
        }

        let stride = channels * format.sample_bytes();
        let capture = Arc::clone(&self.capture);
        let push: PushFn = Box::new(move |data, frames| {
            let bytes = (frames * stride).min(data.len());
            capture.write_audio(&data[..bytes], 0);
        });

        if let Err(e) = backend.record_start(channels, sample_rate, push) {
            tracing::error!("record start failed: {e:#}");
            return;
        }
        inner.record.started = true;
        inner.record.channels = channels;
        inner.record.sample_rate = sample_rate;

        // Restore the record side's retained volume and mute.
        if inner.record.volume_channels > 0 {
            backend.record_volume(&inner.record.volume[..inner.record.volume_channels]);
        }
        backend.record_mute(inner.record.mute);
    }

    pub fn record_stop(&self) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let Some(backend) = inner.backend.as_mut() else {
            return;
        };
        if !inner.record.started {
            return;
        }
        backend.record_stop();
        inner.record.started = false;
    }

    /// Set per-channel record volume (at most 8 channels). Retained across
    /// restarts.
    pub fn record_volume(&self, volume: &[u16]) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let Some(backend) = inner.backend.as_mut() else {
            return;
        };
        let channels = volume.len().min(MAX_VOLUME_CHANNELS);
        inner.record.volume[..channels].copy_from_slice(&volume[..channels]);
        inner.record.volume_channels = channels;
        if inner.record.started {
            backend.record_volume(&inner.record.volume[..channels]);
        }
    }

    /// Set record mute. Retained across restarts.
    pub fn record_mute(&self, mute: bool) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let Some(backend) = inner.backend.as_mut() else {
            return;
        };
        inner.record.mute = mute;
        if inner.record.started {
            backend.record_mute(mute);
        }
    }

    fn teardown_playback(
        backend: &mut dyn AudioBackend,
        playback: &mut PlaybackCtl,
        graph: &dyn GraphSink,
    ) {
        if let Some(stream) = playback.stream.take() {
            // Flip the state first so a callback racing the stop produces
            // silence; the back-end stop is synchronous.
            stream.mark_stopped();
            backend.playback_stop();
            graph.unregister(stream.graph());
        }
    }

    #[cfg(test)]
    fn with_playback_stream<R>(&self, f: impl FnOnce(&PlaybackStream) -> R) -> Option<R> {
        self.inner.lock().unwrap().playback.stream.as_ref().map(f)
    }
}

fn stream_is_active(stream: &Option<PlaybackStream>) -> bool {
    stream.as_ref().is_some_and(|s| s.state().is_active())
}

impl Drop for AudioSystem {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PullFn;
    use crate::graph::NullGraphSink;
    use anyhow::Result;
    use std::sync::atomic::{AtomicI64, Ordering};

    const RATE: u32 = 48_000;
    const CHANNELS: usize = 2;
    const SRC_PERIOD: usize = 480;

    #[derive(Default)]
    struct BackendLog {
        playing: bool,
        setup_calls: u32,
        start_calls: u32,
        stop_calls: u32,
        volume_calls: Vec<Vec<u16>>,
        mute_calls: Vec<bool>,
        record_volume_calls: Vec<Vec<u16>>,
        record_mute_calls: Vec<bool>,
        record_starts: Vec<(usize, u32)>,
        record_stops: u32,
        latency: Option<u64>,
        max_period: usize,
    }

    struct FakeBackend {
        log: Arc<Mutex<BackendLog>>,
        pull: Arc<Mutex<Option<PullFn>>>,
    }

    impl AudioBackend for FakeBackend {
        fn init(&mut self) -> bool {
            true
        }
        fn name(&self) -> &'static str {
            "fake"
        }
        fn supports_playback(&self) -> bool {
            true
        }
        fn supports_record(&self) -> bool {
            true
        }
        fn playback_setup(&mut self, _channels: usize, _rate: u32, pull: PullFn) -> Result<usize> {
            let mut log = self.log.lock().unwrap();
            log.setup_calls += 1;
            *self.pull.lock().unwrap() = Some(pull);
            Ok(log.max_period)
        }
        fn playback_start(&mut self) -> Result<()> {
            let mut log = self.log.lock().unwrap();
            log.start_calls += 1;
            log.playing = true;
            Ok(())
        }
        fn playback_stop(&mut self) {
            let mut log = self.log.lock().unwrap();
            log.stop_calls += 1;
            log.playing = false;
            *self.pull.lock().unwrap() = None;
        }
        fn playback_volume(&mut self, volume: &[u16]) -> bool {
            self.log.lock().unwrap().volume_calls.push(volume.to_vec());
            true
        }
        fn playback_mute(&mut self, mute: bool) -> bool {
            self.log.lock().unwrap().mute_calls.push(mute);
            true
        }
        fn playback_latency(&self) -> Option<u64> {
            self.log.lock().unwrap().latency
        }
        fn record_start(&mut self, channels: usize, rate: u32, _push: PushFn) -> Result<()> {
            self.log.lock().unwrap().record_starts.push((channels, rate));
            Ok(())
        }
        fn record_stop(&mut self) {
            self.log.lock().unwrap().record_stops += 1;
        }
        fn record_volume(&mut self, volume: &[u16]) -> bool {
            self.log
                .lock()
                .unwrap()
                .record_volume_calls
                .push(volume.to_vec());
            true
        }
        fn record_mute(&mut self, mute: bool) -> bool {
            self.log.lock().unwrap().record_mute_calls.push(mute);
            true
        }
    }

    struct Harness {
        sys: AudioSystem,
        log: Arc<Mutex<BackendLog>>,
        pull: Arc<Mutex<Option<PullFn>>>,
        time: Arc<AtomicI64>,
    }

    impl Harness {
        fn new(max_period: usize) -> Self {
            let log = Arc::new(Mutex::new(BackendLog {
                max_period,
                ..BackendLog::default()
            }));
            let pull = Arc::new(Mutex::new(None));
            let time = Arc::new(AtomicI64::new(0));
            let clock_time = Arc::clone(&time);
            let clock: NanoClock = Arc::new(move || clock_time.load(Ordering::Relaxed));
            let sys = AudioSystem::init_with(
                vec![Box::new(FakeBackend {
                    log: Arc::clone(&log),
                    pull: Arc::clone(&pull),
                })],
                Arc::new(NullCaptureSink),
                Arc::new(NullGraphSink),
                Tuning::default(),
                clock,
            );
            Harness {
                sys,
                log,
                pull,
                time,
            }
        }

        fn set_time(&self, ns: i64) {
            self.time.store(ns, Ordering::Relaxed);
        }

        fn submit(&self, frames: usize) {
            let data = vec![0u8; frames * CHANNELS * 2];
            self.sys.playback_data(&data);
        }

        /// Invoke the captured device callback, simulating the device
        /// thread. Returns frames of real audio produced.
        fn pull(&self, frames: usize) -> usize {
            let mut buf = vec![0.0f32; frames * CHANNELS];
            let mut slot = self.pull.lock().unwrap();
            match slot.as_mut() {
                Some(cb) => cb(&mut buf),
                None => 0,
            }
        }

        fn playing(&self) -> bool {
            self.log.lock().unwrap().playing
        }

        fn state(&self) -> Option<StreamState> {
            self.sys.with_playback_stream(|s| s.state())
        }

        fn start_stream(&self) {
            self.sys
                .playback_start(CHANNELS, RATE, SourceFormat::S16Le, 0);
        }

        /// Interleave source submits (every `SRC_PERIOD` frames of wall
        /// time) with device pulls at the device's own cadence, from
        /// `start_s` for `seconds` of virtual time. Returns total real
        /// frames pulled.
        fn run_duplex(
            &self,
            start_s: f64,
            seconds: f64,
            dev_frames: &mut dyn FnMut(f64) -> usize,
        ) -> usize {
            let end = ((start_s + seconds) * 1e9) as i64;
            let submit_step = (SRC_PERIOD as f64 / RATE as f64 * 1e9) as i64;
            let mut next_submit = (start_s * 1e9) as i64;
            let mut next_pull: Option<i64> = None;
            let mut produced = 0usize;

            while next_submit < end {
                match next_pull {
                    Some(p) if p <= next_submit => {
                        self.set_time(p);
                        let frames = dev_frames(p as f64 / 1e9);
                        produced += self.pull(frames);
                        let step = (frames as f64 / RATE as f64 * 1e9) as i64;
                        next_pull = Some(p + step);
                    }
                    _ => {
                        self.set_time(next_submit);
                        self.submit(SRC_PERIOD);
                        if next_pull.is_none() && self.playing() {
                            let frames = dev_frames(next_submit as f64 / 1e9);
                            let step = (frames as f64 / RATE as f64 * 1e9) as i64;
                            next_pull = Some(next_submit + step);
                        }
                        next_submit += submit_step;
                    }
                }
            }
            produced
        }

        /// Newest buffered-offset reading, in frames, from the latency
        /// sink.
        fn last_offset_frames(&self) -> f64 {
            let samples = self
                .sys
                .with_playback_stream(|s| s.latency_samples())
                .unwrap();
            let mut last = 0.0f32;
            while let Some(v) = samples.pop() {
                last = v;
            }
            last as f64 * RATE as f64 / 1000.0
        }
    }

    #[test]
    fn no_backend_disables_everything() {
        let sys = AudioSystem::init(
            Vec::new(),
            Arc::new(NullCaptureSink),
            Arc::new(NullGraphSink),
        );
        assert!(!sys.supports_playback());
        assert!(!sys.supports_record());
        sys.playback_start(2, 48_000, SourceFormat::S16Le, 0);
        sys.playback_data(&[0u8; 1920]);
        sys.playback_volume(&[0x8000, 0x8000]);
        sys.playback_stop();
        sys.record_start(1, 16_000, SourceFormat::S16Le);
        sys.free();
    }

    #[test]
    fn unsupported_format_is_a_silent_no_op() {
        let h = Harness::new(1024);
        h.sys.playback_start(CHANNELS, RATE, SourceFormat::F32Le, 0);
        assert!(h.state().is_none());
        assert_eq!(h.log.lock().unwrap().setup_calls, 0);
    }

    #[test]
    fn priming_holds_run_until_threshold() {
        // RUN requires 2·period + 2·max_period = 2·480 + 2·1024 frames.
        let h = Harness::new(1024);
        h.start_stream();
        assert_eq!(h.state(), Some(StreamState::Setup));

        for k in 0..6 {
            h.set_time(k * 10_000_000);
            h.submit(SRC_PERIOD);
        }
        assert_eq!(h.log.lock().unwrap().start_calls, 0);
        assert_eq!(h.state(), Some(StreamState::Setup));

        for k in 6..8 {
            h.set_time(k * 10_000_000);
            h.submit(SRC_PERIOD);
        }
        assert_eq!(h.log.lock().unwrap().start_calls, 1);
        assert_eq!(h.state(), Some(StreamState::Run));
    }

    #[test]
    fn drain_plays_out_every_buffered_frame() {
        let h = Harness::new(1024);
        h.start_stream();
        for k in 0..10 {
            h.set_time(k * 10_000_000);
            h.submit(SRC_PERIOD);
        }
        assert_eq!(h.state(), Some(StreamState::Run));

        let buffered = h
            .sys
            .with_playback_stream(|s| s.debug_positions().1)
            .unwrap();
        h.sys.playback_stop();
        assert_eq!(h.state(), Some(StreamState::Drain));

        // Submits during drain are ignored.
        h.submit(SRC_PERIOD);

        let mut produced = 0usize;
        for k in 0..40 {
            h.set_time(100_000_000 + k * 21_333_333);
            produced += h.pull(1024);
            if h.state() == Some(StreamState::Stop) {
                break;
            }
        }
        assert_eq!(produced, buffered);
        assert_eq!(h.state(), Some(StreamState::Stop));

        // The next façade call releases the stream.
        h.submit(SRC_PERIOD);
        assert!(h.state().is_none());
        assert_eq!(h.log.lock().unwrap().stop_calls, 1);
    }

    #[test]
    fn source_clock_jump_slews_with_exact_accounting() {
        let h = Harness::new(1024);
        h.start_stream();
        for k in 0..10 {
            h.set_time(k * 10_000_000);
            h.submit(SRC_PERIOD);
        }
        let (pos_before, ring_before) = h
            .sys
            .with_playback_stream(|s| s.debug_positions())
            .unwrap();

        // Jump the source clock 0.3 s forward: exactly 14 400 zeroed frames
        // are appended and the position accounting follows.
        h.set_time(100_000_000 + 300_000_000);
        h.submit(SRC_PERIOD);

        let (pos_after, ring_after) = h
            .sys
            .with_playback_stream(|s| s.debug_positions())
            .unwrap();
        assert_eq!(
            h.sys.with_playback_stream(|s| s.debug_slew_count()),
            Some(1)
        );

        let generated = (pos_after - pos_before) - 14_400;
        assert!(
            (SRC_PERIOD as i64 - generated).abs() <= 16,
            "generated {generated}"
        );
        assert_eq!(
            ring_after as i64 - ring_before as i64,
            pos_after - pos_before
        );
    }

    #[test]
    fn steady_state_converges_and_never_slews() {
        let h = Harness::new(1024);
        h.start_stream();

        h.run_duplex(0.0, 2.0, &mut |_| 1024);
        let early_offset = h.last_offset_frames();

        h.run_duplex(2.0, 8.0, &mut |_| 1024);
        let late_offset = h.last_offset_frames();
        let error = h
            .sys
            .with_playback_stream(|s| s.debug_offset_error())
            .unwrap();

        // Matched clocks: the controller walks the buffered offset toward
        // the target without ever tripping a slew, and the ratio stays far
        // below the pitch-perception threshold throughout.
        assert_eq!(h.sys.with_playback_stream(|s| s.debug_slew_count()), Some(0));
        assert!(
            late_offset < early_offset - 50.0,
            "early {early_offset}, late {late_offset}"
        );
        let target = 13.0 * 48.0 + 1024.0 * 1.1;
        assert!(late_offset > target - 1_024.0);
        assert!(late_offset < target + 2_048.0);
        let tuning = Tuning::default();
        assert!(tuning.ratio_kp * error.abs() < 1e-3);
        assert_eq!(h.state(), Some(StreamState::Run));
    }

    #[test]
    fn device_period_step_raises_target_without_slewing() {
        let h = Harness::new(1024);
        h.start_stream();
        h.run_duplex(0.0, 3.0, &mut |_| 1024);

        let target_before = h
            .sys
            .with_playback_stream(|s| s.debug_target_latency())
            .unwrap();
        assert!((target_before - (13.0 * 48.0 + 1024.0 * 1.1)).abs() < 1e-9);

        // Device drops to quarter periods mid-stream.
        h.run_duplex(3.0, 3.0, &mut |_| 256);

        let target_after = h
            .sys
            .with_playback_stream(|s| s.debug_target_latency())
            .unwrap();
        assert!((target_after - target_before - 768.0).abs() < 1e-9);
        assert_eq!(h.sys.with_playback_stream(|s| s.debug_slew_count()), Some(0));
        assert_eq!(h.state(), Some(StreamState::Run));
    }

    #[test]
    fn volume_and_mute_survive_restart() {
        let h = Harness::new(1024);
        h.sys.playback_volume(&[0x8000, 0x8000]);
        h.sys.playback_mute(true);
        // Not active yet: nothing forwarded.
        assert!(h.log.lock().unwrap().volume_calls.is_empty());

        h.start_stream();
        {
            let log = h.log.lock().unwrap();
            assert_eq!(log.volume_calls, vec![vec![0x8000, 0x8000]]);
            assert_eq!(log.mute_calls, vec![true]);
        }

        // Stop, then start again: the same values arrive before any data.
        h.sys.playback_stop();
        h.start_stream();
        {
            let log = h.log.lock().unwrap();
            assert_eq!(log.volume_calls.len(), 2);
            assert_eq!(log.volume_calls[1], vec![0x8000, 0x8000]);
            assert_eq!(log.mute_calls, vec![true, true]);
        }
    }

    #[test]
    fn volume_clamps_to_eight_channels() {
        let h = Harness::new(1024);
        h.start_stream();
        h.sys.playback_volume(&[1u16; 12]);
        let log = h.log.lock().unwrap();
        assert_eq!(log.volume_calls.last().unwrap().len(), 8);
    }

    #[test]
    fn restart_while_active_stops_immediately() {
        let h = Harness::new(1024);
        h.start_stream();
        for k in 0..10 {
            h.set_time(k * 10_000_000);
            h.submit(SRC_PERIOD);
        }
        assert_eq!(h.state(), Some(StreamState::Run));

        h.start_stream();
        let log = h.log.lock().unwrap();
        assert_eq!(log.stop_calls, 1);
        assert_eq!(log.setup_calls, 2);
        drop(log);
        assert_eq!(h.state(), Some(StreamState::Setup));
    }

    #[test]
    fn record_restarts_only_on_parameter_change() {
        let h = Harness::new(1024);
        h.sys.record_start(1, 16_000, SourceFormat::S16Le);
        h.sys.record_start(1, 16_000, SourceFormat::S16Le);
        {
            let log = h.log.lock().unwrap();
            assert_eq!(log.record_starts, vec![(1, 16_000)]);
            assert_eq!(log.record_stops, 0);
        }

        h.sys.record_start(2, 48_000, SourceFormat::S16Le);
        let log = h.log.lock().unwrap();
        assert_eq!(log.record_starts, vec![(1, 16_000), (2, 48_000)]);
        assert_eq!(log.record_stops, 1);
    }

    #[test]
    fn record_restart_applies_record_volume() {
        // The record restart restores the record side's own retained
        // values, never the playback side's.
        let h = Harness::new(1024);
        h.sys.playback_volume(&[0x1111, 0x1111]);
        h.sys.record_volume(&[0x2222]);
        h.sys.record_mute(true);

        h.sys.record_start(1, 16_000, SourceFormat::S16Le);
        let log = h.log.lock().unwrap();
        assert_eq!(log.record_volume_calls, vec![vec![0x2222]]);
        assert_eq!(log.record_mute_calls, vec![true]);
    }

    #[test]
    fn free_releases_backend_after_both_directions() {
        let h = Harness::new(1024);
        h.start_stream();
        h.sys.record_start(2, RATE, SourceFormat::S16Le);
        h.sys.free();
        {
            let log = h.log.lock().unwrap();
            assert_eq!(log.stop_calls, 1);
            assert_eq!(log.record_stops, 1);
        }
        assert!(!h.sys.supports_playback());
        // Everything is a no-op afterwards.
        h.start_stream();
        assert!(h.state().is_none());
    }
}
