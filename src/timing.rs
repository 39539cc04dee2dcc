//! Device→source timing hand-off.
//!
//! The device callback posts one [`DeviceTick`] per period after updating
//! its PLL; the source thread drains every pending tick at the top of each
//! submit and keeps the last two for position interpolation. Ticks ride an
//! `rtrb` ring buffer: fixed capacity, wait-free and allocation-free on
//! both ends, so posting is safe from the device's realtime thread.

/// Snapshot of the device PLL after one callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct DeviceTick {
    pub(crate) period_frames: usize,
    pub(crate) next_time: i64,
    pub(crate) next_position: i64,
}

/// Producer half; owned by the device callback.
pub(crate) struct TickSender {
    tx: rtrb::Producer<DeviceTick>,
}

/// Consumer half; owned by the source-side stream.
pub(crate) struct TickReceiver {
    rx: rtrb::Consumer<DeviceTick>,
}

pub(crate) fn timing_channel(capacity: usize) -> (TickSender, TickReceiver) {
    let (tx, rx) = rtrb::RingBuffer::new(capacity);
    (TickSender { tx }, TickReceiver { rx })
}

impl TickSender {
    /// Post a tick. If the source thread has fallen a full queue behind, the
    /// newest tick is dropped; it only keeps the last two anyway.
    pub(crate) fn post(&mut self, tick: DeviceTick) {
        let _ = self.tx.push(tick);
    }
}

impl TickReceiver {
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = DeviceTick> + '_ {
        std::iter::from_fn(move || self.rx.pop().ok())
    }
}
