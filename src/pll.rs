//! Second-order type-II PLL over periodic callback arrivals.
//!
//! Converts a sequence of `(arrival_time, frame_count)` events into a
//! smoothed model `(next_time, next_position, period_sec)` that is robust to
//! millisecond-scale scheduling jitter. One instance runs on the device
//! callback thread, another on the source thread; neither touches the ring
//! buffer itself. A large clock error is reported as a slew frame count and
//! the owning thread applies it to its side of the ring.

use std::f64::consts::{PI, SQRT_2};

/// How `next_position` advances on each update.
#[derive(Clone, Copy, Debug)]
pub(crate) enum PositionAdvance {
    /// Position advances by the frames consumed in the callback (device
    /// side).
    Consumed,
    /// Position is advanced externally by resampler output
    /// ([`PllClock::add_output_frames`]); updates only move it on a slew
    /// (source side).
    External,
}

/// Result of one PLL update.
///
/// `cur_time`/`cur_position` are the model's prediction for *this* event,
/// captured before the filter step; the latency controller interpolates the
/// device position against them.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PllUpdate {
    pub(crate) cur_time: i64,
    pub(crate) cur_position: i64,
    /// Non-zero when the clock error crossed the slew threshold; the caller
    /// must slew its ring cursor by exactly this many frames.
    pub(crate) slew_frames: i64,
}

pub(crate) struct PllClock {
    sample_rate: f64,
    bandwidth_hz: f64,
    slew_threshold_sec: f64,
    advance: PositionAdvance,

    period_frames: usize,
    period_sec: f64,
    next_time: i64,
    next_position: i64,
    b: f64,
    c: f64,
    slews: u64,
}

fn nanos(sec: f64) -> i64 {
    (sec * 1.0e9).round() as i64
}

impl PllClock {
    pub(crate) fn new(
        sample_rate: u32,
        bandwidth_hz: f64,
        slew_threshold_sec: f64,
        advance: PositionAdvance,
    ) -> Self {
        Self {
            sample_rate: sample_rate as f64,
            bandwidth_hz,
            slew_threshold_sec,
            advance,
            period_frames: 0,
            period_sec: 0.0,
            next_time: 0,
            next_position: 0,
            b: 0.0,
            c: 0.0,
            slews: 0,
        }
    }

    /// Feed one callback event into the loop.
    pub(crate) fn update(&mut self, now: i64, frames: usize) -> PllUpdate {
        if frames != self.period_frames {
            let init = self.period_frames == 0;
            if init {
                self.next_time = now;
            }
            let cur_time = self.next_time;
            let cur_position = self.next_position;

            let new_period = frames as f64 / self.sample_rate;
            // Double-buffered devices request the new period size one
            // callback before the previous buffer finishes playing, so the
            // predicted wake time must advance by the old period, not the
            // new one.
            let advance_sec = if init { new_period } else { self.period_sec };
            self.next_time += nanos(advance_sec);
            self.period_frames = frames;
            self.period_sec = new_period;
            if let PositionAdvance::Consumed = self.advance {
                self.next_position += frames as i64;
            }
            self.recompute_coefficients();
            return PllUpdate {
                cur_time,
                cur_position,
                slew_frames: 0,
            };
        }

        let error = (now - self.next_time) as f64 * 1.0e-9;
        if error.abs() >= self.slew_threshold_sec {
            // Clock error is too high; slew the ring cursor and reset the
            // timing parameters rather than dragging the filter through it.
            let slew_frames = (error * self.sample_rate).round() as i64;
            let cur_time = now;
            let cur_position = self.next_position + slew_frames;

            self.period_sec = frames as f64 / self.sample_rate;
            self.next_time = now + nanos(self.period_sec);
            self.next_position = match self.advance {
                PositionAdvance::Consumed => cur_position + frames as i64,
                PositionAdvance::External => cur_position,
            };
            self.slews += 1;
            PllUpdate {
                cur_time,
                cur_position,
                slew_frames,
            }
        } else {
            let cur_time = self.next_time;
            let cur_position = self.next_position;
            self.next_time += nanos(self.b * error + self.period_sec);
            self.period_sec += self.c * error;
            if let PositionAdvance::Consumed = self.advance {
                self.next_position += frames as i64;
            }
            PllUpdate {
                cur_time,
                cur_position,
                slew_frames: 0,
            }
        }
    }

    /// Advance the position by resampler output (External mode only).
    pub(crate) fn add_output_frames(&mut self, frames: usize) {
        self.next_position += frames as i64;
    }

    fn recompute_coefficients(&mut self) {
        let omega = 2.0 * PI * self.bandwidth_hz * self.period_sec;
        self.b = SQRT_2 * omega;
        self.c = omega * omega;
    }

    pub(crate) fn period_frames(&self) -> usize {
        self.period_frames
    }

    pub(crate) fn period_sec(&self) -> f64 {
        self.period_sec
    }

    pub(crate) fn next_time(&self) -> i64 {
        self.next_time
    }

    pub(crate) fn next_position(&self) -> i64 {
        self.next_position
    }

    /// Loop coefficients, shared with the offset-error smoother.
    pub(crate) fn coefficients(&self) -> (f64, f64) {
        (self.b, self.c)
    }

    pub(crate) fn slew_count(&self) -> u64 {
        self.slews
    }
}
