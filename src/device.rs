//! Audio back-end capability interface and selection.
//!
//! The playback core treats the platform audio layer as an abstract
//! capability: a back-end can offer playback, record, and a handful of
//! optional operations (volume, mute, latency reporting). Optional
//! operations default to "not handled" so call sites never branch on
//! missing function pointers.

use anyhow::Result;

/// Pull callback installed by `playback_setup`.
///
/// Invoked on the device's realtime thread with an interleaved `f32` output
/// buffer; returns the number of frames filled with real audio. The back-end
/// silences the remainder.
pub type PullFn = Box<dyn FnMut(&mut [f32]) -> usize + Send + 'static>;

/// Push callback installed by `record_start`.
///
/// Invoked on the device thread with `frames` frames of interleaved s16le
/// capture data.
pub type PushFn = Box<dyn FnMut(&[u8], usize) + Send + 'static>;

/// Platform audio back-end capability.
///
/// `playback_stop` and `record_stop` are synchronous: after they return, no
/// further callbacks run and the buffers behind them may be torn down.
pub trait AudioBackend: Send {
    /// One-shot initialisation. Returning false removes this back-end from
    /// selection.
    fn init(&mut self) -> bool;

    fn name(&self) -> &'static str;

    fn supports_playback(&self) -> bool;

    fn supports_record(&self) -> bool;

    /// Prepare a playback stream and install `pull`. Returns the maximum
    /// period size, in frames, the device may request per callback.
    fn playback_setup(&mut self, channels: usize, sample_rate: u32, pull: PullFn)
        -> Result<usize>;

    /// Begin invoking the pull callback.
    fn playback_start(&mut self) -> Result<()>;

    /// Stop callbacks and release the stream.
    fn playback_stop(&mut self);

    /// Apply per-channel volume. Returns true when handled.
    fn playback_volume(&mut self, volume: &[u16]) -> bool {
        let _ = volume;
        false
    }

    /// Apply mute. Returns true when handled.
    fn playback_mute(&mut self, mute: bool) -> bool {
        let _ = mute;
        false
    }

    /// Frames currently buffered inside the device, when the back-end can
    /// report it.
    fn playback_latency(&self) -> Option<u64> {
        None
    }

    fn record_start(&mut self, channels: usize, sample_rate: u32, push: PushFn) -> Result<()>;

    fn record_stop(&mut self);

    fn record_volume(&mut self, volume: &[u16]) -> bool {
        let _ = volume;
        false
    }

    fn record_mute(&mut self, mute: bool) -> bool {
        let _ = mute;
        false
    }
}

/// Try back-ends in order and keep the first that initialises.
pub fn select_backend(backends: Vec<Box<dyn AudioBackend>>) -> Option<Box<dyn AudioBackend>> {
    for mut backend in backends {
        if backend.init() {
            tracing::info!(backend = backend.name(), "audio backend selected");
            return Some(backend);
        }
        tracing::debug!(backend = backend.name(), "audio backend unavailable");
    }
    tracing::warn!("no audio backend could be initialised");
    None
}
