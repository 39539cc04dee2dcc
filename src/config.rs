//! Tuning knobs for the playback clock-recovery pipeline.

/// Numeric tuning for the playback pipeline.
///
/// The defaults are the values the pipeline was calibrated with; tests
/// occasionally tighten them, hosts normally leave them alone.
#[derive(Clone, Copy, Debug)]
pub struct Tuning {
    /// Loop bandwidth of both PLL clock estimators, in Hz.
    ///
    /// An order of magnitude below audible modulation; converges within a
    /// few seconds.
    pub pll_bandwidth_hz: f64,

    /// Fixed latency allowance for source-side packet jitter, in
    /// milliseconds. Source bursts can be delayed by a whole period or more.
    pub source_jitter_ms: f64,

    /// Clock error beyond which the PLL slews instead of filtering, in
    /// seconds.
    pub slew_threshold_sec: f64,

    /// Proportional gain of the resample-ratio PI controller.
    pub ratio_kp: f64,

    /// Integral gain of the resample-ratio PI controller.
    pub ratio_ki: f64,

    /// Initial audio ring capacity, in seconds of audio. The ring grows on
    /// demand past this.
    pub buffer_seconds: f64,

    /// Display range of the latency graph, in milliseconds. Out-of-range
    /// samples are clipped by the graph, not the controller.
    pub graph_range_ms: (f32, f32),

    /// Capacity of the device→source timing queue, in ticks.
    pub timing_queue_len: usize,

    /// Capacity of the latency-sample sink, in samples.
    pub latency_sink_len: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            pll_bandwidth_hz: 0.05,
            source_jitter_ms: 13.0,
            slew_threshold_sec: 0.2,
            ratio_kp: 0.5e-6,
            ratio_ki: 1.0e-16,
            buffer_seconds: 1.0,
            graph_range_ms: (0.0, 200.0),
            timing_queue_len: 16,
            latency_sink_len: 1200,
        }
    }
}
