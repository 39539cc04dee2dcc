//! Buffered-latency measurement and the resample-ratio PI controller.
//!
//! The source thread interpolates the device's playback position between its
//! last two timing ticks, measures how far the buffered offset sits from the
//! target latency, filters that error with the source PLL's loop
//! coefficients (it can change rapidly at stream start, and unfiltered it
//! would produce audible pitch steps), and feeds the result through a PI
//! controller whose output is the sample-rate-conversion ratio.

use crate::config::Tuning;
use crate::timing::DeviceTick;

/// Result of one controller period.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RatioUpdate {
    /// Resample ratio for this period.
    pub(crate) ratio: f64,
    /// Measured offset in frames; 0.0 until two device ticks have arrived.
    pub(crate) actual_offset: f64,
}

pub(crate) struct LatencyController {
    sample_rate: f64,
    source_jitter_ms: f64,
    kp: f64,
    ki: f64,

    dev_period_frames: usize,
    dev_last_time: i64,
    dev_next_time: i64,
    dev_last_position: i64,
    dev_next_position: i64,

    offset_error: f64,
    offset_error_integral: f64,
    ratio_integral: f64,
}

impl LatencyController {
    pub(crate) fn new(sample_rate: u32, tuning: &Tuning) -> Self {
        Self {
            sample_rate: sample_rate as f64,
            source_jitter_ms: tuning.source_jitter_ms,
            kp: tuning.ratio_kp,
            ki: tuning.ratio_ki,
            dev_period_frames: 0,
            dev_last_time: i64::MIN,
            dev_next_time: i64::MIN,
            dev_last_position: 0,
            dev_next_position: 0,
            offset_error: 0.0,
            offset_error_integral: 0.0,
            ratio_integral: 0.0,
        }
    }

    /// Shift in one device tick; the previous newest becomes the
    /// interpolation anchor.
    pub(crate) fn observe_tick(&mut self, tick: DeviceTick) {
        self.dev_period_frames = tick.period_frames;
        self.dev_last_time = self.dev_next_time;
        self.dev_last_position = self.dev_next_position;
        self.dev_next_time = tick.next_time;
        self.dev_next_position = tick.next_position;
    }

    /// Desired buffered offset in frames.
    ///
    /// A fixed allowance for source packet jitter, plus the device's maximum
    /// period with a multiplier so timing requirements tighten as the period
    /// shrinks. When the device runs below its maximum period the
    /// double-buffered transition banks extra frames in the ring; the
    /// difference is added so the controller does not chase that surplus and
    /// underrun when the period grows back.
    pub(crate) fn target_latency_frames(&self, device_max_period: usize) -> f64 {
        let mut target =
            self.source_jitter_ms * self.sample_rate / 1000.0 + device_max_period as f64 * 1.1;
        if self.dev_period_frames < device_max_period {
            target += (device_max_period - self.dev_period_frames) as f64;
        }
        target
    }

    /// Run one controller period.
    ///
    /// `cur_time`/`cur_position` are the source PLL's pre-filter predictions
    /// for this period; `coefficients` and `period_sec` come from the same
    /// PLL.
    pub(crate) fn update(
        &mut self,
        cur_time: i64,
        cur_position: i64,
        coefficients: (f64, f64),
        period_sec: f64,
        device_max_period: usize,
    ) -> RatioUpdate {
        let mut actual_offset = 0.0;
        // The PI controller consumes the error from before this period's
        // smoothing step.
        let offset_error = self.offset_error;

        if self.dev_last_time != i64::MIN {
            let (b, c) = coefficients;
            let span = (self.dev_next_time - self.dev_last_time) as f64;
            let dev_position = self.dev_last_position as f64
                + (self.dev_next_position - self.dev_last_position) as f64
                    * ((cur_time - self.dev_last_time) as f64 / span);

            actual_offset = cur_position as f64 - dev_position;
            let actual_offset_error =
                -(actual_offset - self.target_latency_frames(device_max_period));

            let err = actual_offset_error - offset_error;
            self.offset_error += b * err + self.offset_error_integral;
            self.offset_error_integral += c * err;
        }

        self.ratio_integral += offset_error * period_sec;
        let ratio = 1.0 + self.kp * offset_error + self.ki * self.ratio_integral;
        RatioUpdate {
            ratio,
            actual_offset,
        }
    }

    pub(crate) fn offset_error(&self) -> f64 {
        self.offset_error
    }
}
