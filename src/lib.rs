//! Audio Relay — a bidirectional audio bridge with adaptive resampling and
//! dual-loop clock recovery.
//!
//! A remote source delivers 16-bit PCM in network-paced bursts; a local
//! device pulls float frames on its own hardware clock. The two clocks
//! drift independently and neither is the system clock, so naive forwarding
//! underruns or overruns within seconds.
//!
//! ## Pipeline
//! 1. **Submit** (source thread): s16le bursts are converted to `f32`, the
//!    source-side PLL timestamps them, and the latency controller turns the
//!    measured buffered offset into a resample ratio.
//! 2. **Resample**: a streaming sinc resampler (Rubato) stretches or
//!    shrinks each period by fractions of a percent, steering buffered
//!    latency toward a jitter-absorbing target without audible pitch shift.
//! 3. **Pull** (device callback): the device-side PLL timestamps each
//!    callback and posts a timing tick back to the source thread; frames
//!    are consumed from a lock-free ring.
//!
//! Clock errors past ±0.2 s are recovered by slewing the ring cursors
//! instead of dragging the loop filters through them.
//!
//! ## Hosts
//! Construct an [`AudioSystem`] with an ordered list of back-ends (see
//! [`CpalBackend`]), a [`CaptureSink`] for the record direction, and a
//! [`GraphSink`] for latency telemetry ([`NullGraphSink`] when headless).

pub mod config;
pub mod convert;
pub mod device;
pub mod graph;

mod audio;
mod engine;
mod latency;
mod pll;
mod resample;
mod ring;
mod timing;

#[cfg(feature = "cpal-backend")]
pub mod cpal_backend;

pub use audio::{AudioSystem, CaptureSink, NullCaptureSink};
pub use config::Tuning;
pub use convert::SourceFormat;
pub use device::{select_backend, AudioBackend, PullFn, PushFn};
pub use engine::{NanoClock, StreamState};
pub use graph::{latency_graph_title, GraphFormatter, GraphId, GraphSink, NullGraphSink};

#[cfg(feature = "cpal-backend")]
pub use cpal_backend::CpalBackend;

/// Back-ends to try at [`AudioSystem::init`], in preference order.
#[cfg(feature = "cpal-backend")]
pub fn default_backends() -> Vec<Box<dyn AudioBackend>> {
    vec![Box::new(CpalBackend::new())]
}
