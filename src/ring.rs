//! Unbounded SPSC audio ring for the playback hot path.
//!
//! The source thread appends resampled interleaved `f32` frames, the device
//! callback consumes them. Capacity grows on demand, and either cursor can
//! be slewed by a signed frame count to recover from large clock errors;
//! those two requirements are why this ring is bespoke rather than an
//! off-the-shelf bounded SPSC (the fixed-capacity timing queue in
//! `timing.rs` rides `rtrb` instead).
//!
//! Neither side ever blocks. A reader observes all appends sequenced before
//! the producer's release; no other ordering is promised.
//!
//! Samples in the audio ring are stored as `AtomicU32` bit patterns. Cursor
//! slews can momentarily expose a cell to both sides (the same window exists
//! in any ring that rewinds its cursors); per-cell atomics keep that window
//! benign instead of undefined.

use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_utils::CachePadded;

struct Block {
    mask: u64,
    cells: Box<[AtomicU32]>,
}

impl Block {
    fn alloc(capacity: usize) -> Box<Block> {
        debug_assert!(capacity.is_power_of_two());
        Box::new(Block {
            mask: capacity as u64 - 1,
            cells: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
        })
    }

    fn capacity(&self) -> u64 {
        self.mask + 1
    }
}

struct AudioShared {
    block: AtomicPtr<Block>,
    /// Absolute sample position of the next unread sample. Reader-owned.
    head: CachePadded<AtomicU64>,
    /// Absolute sample position one past the last committed sample.
    /// Writer-owned.
    tail: CachePadded<AtomicU64>,
    /// Blocks replaced by growth. Kept alive until both halves drop so a
    /// reader mid-consume can never observe a freed block. Locked only by
    /// the writer, and only while growing.
    retired: Mutex<Vec<*mut Block>>,
    channels: usize,
}

unsafe impl Send for AudioShared {}
unsafe impl Sync for AudioShared {}

impl Drop for AudioShared {
    fn drop(&mut self) {
        // SAFETY: both halves are gone; every pointer here came from
        // Box::into_raw and is freed exactly once.
        unsafe {
            drop(Box::from_raw(self.block.load(Ordering::Relaxed)));
            for p in self.retired.get_mut().unwrap().drain(..) {
                drop(Box::from_raw(p));
            }
        }
    }
}

/// Producer half of the audio ring. Lives on the source thread.
pub(crate) struct AudioWriter {
    shared: Arc<AudioShared>,
}

/// Consumer half of the audio ring. Lives in the device callback.
pub(crate) struct AudioReader {
    shared: Arc<AudioShared>,
}

/// Create an unbounded interleaved ring with an initial capacity of
/// `initial_frames` frames of `channels` channels.
pub(crate) fn audio_ring(initial_frames: usize, channels: usize) -> (AudioWriter, AudioReader) {
    assert!(channels > 0);
    let capacity = (initial_frames.max(1) * channels).next_power_of_two();
    let shared = Arc::new(AudioShared {
        block: AtomicPtr::new(Box::into_raw(Block::alloc(capacity))),
        head: CachePadded::new(AtomicU64::new(0)),
        tail: CachePadded::new(AtomicU64::new(0)),
        retired: Mutex::new(Vec::new()),
        channels,
    });
    (
        AudioWriter {
            shared: Arc::clone(&shared),
        },
        AudioReader { shared },
    )
}

fn len_frames(shared: &AudioShared) -> usize {
    let tail = shared.tail.load(Ordering::Acquire);
    let head = shared.head.load(Ordering::Acquire);
    (tail.saturating_sub(head) as usize) / shared.channels
}

impl AudioWriter {
    /// Append interleaved samples, growing the ring if needed.
    pub(crate) fn append(&mut self, samples: &[f32]) {
        debug_assert_eq!(samples.len() % self.shared.channels, 0);
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let block = self.ensure_capacity(tail, samples.len() as u64);
        for (i, &s) in samples.iter().enumerate() {
            let pos = tail + i as u64;
            block.cells[(pos & block.mask) as usize].store(s.to_bits(), Ordering::Relaxed);
        }
        self.shared
            .tail
            .store(tail + samples.len() as u64, Ordering::Release);
    }

    /// Slew the write cursor by `frames`. Positive counts append that many
    /// zeroed frames; negative counts retract unread frames, clamped so the
    /// cursors never cross. Returns the signed frame count applied.
    pub(crate) fn append_silence(&mut self, frames: i64) -> i64 {
        let channels = self.shared.channels as u64;
        let tail = self.shared.tail.load(Ordering::Relaxed);
        if frames >= 0 {
            let n = frames as u64 * channels;
            let block = self.ensure_capacity(tail, n);
            for pos in tail..tail + n {
                block.cells[(pos & block.mask) as usize].store(0, Ordering::Relaxed);
            }
            self.shared.tail.store(tail + n, Ordering::Release);
            frames
        } else {
            let head = self.shared.head.load(Ordering::Acquire);
            let avail = tail.saturating_sub(head) / channels;
            let k = avail.min(frames.unsigned_abs());
            self.shared
                .tail
                .store(tail - k * channels, Ordering::Release);
            -(k as i64)
        }
    }

    /// Live frame count.
    pub(crate) fn len_frames(&self) -> usize {
        len_frames(&self.shared)
    }

    /// Make room for `extra` more samples past `tail`, growing (and
    /// republishing) the block if the current one is too small.
    fn ensure_capacity(&mut self, tail: u64, extra: u64) -> &Block {
        let head = self.shared.head.load(Ordering::Acquire);
        let used = tail - head;
        // SAFETY: the current block pointer is always valid; blocks are only
        // freed once both halves are dropped.
        let block = unsafe { &*self.shared.block.load(Ordering::Relaxed) };
        if used + extra <= block.capacity() {
            return block;
        }

        let mut capacity = block.capacity() as usize;
        while (used + extra) as usize > capacity {
            capacity *= 2;
        }
        let grown = Block::alloc(capacity);
        for pos in head..tail {
            let bits = block.cells[(pos & block.mask) as usize].load(Ordering::Relaxed);
            grown.cells[(pos & grown.mask) as usize].store(bits, Ordering::Relaxed);
        }
        let old = self
            .shared
            .block
            .swap(Box::into_raw(grown), Ordering::Release);
        self.shared.retired.lock().unwrap().push(old);
        tracing::debug!(samples = capacity, "audio ring grown");
        // SAFETY: as above; the freshly published block is valid.
        unsafe { &*self.shared.block.load(Ordering::Relaxed) }
    }
}

impl AudioReader {
    /// Copy out up to `dst.len()` samples (whole frames only) and advance
    /// the read cursor. Returns the number of frames produced.
    pub(crate) fn read(&mut self, dst: &mut [f32]) -> usize {
        let channels = self.shared.channels;
        let head = self.shared.head.load(Ordering::Relaxed);
        let tail = self.shared.tail.load(Ordering::Acquire);
        let avail = tail.saturating_sub(head) as usize;
        let frames = avail.min(dst.len()) / channels;
        let n = (frames * channels) as u64;
        // Load the block only after tail: the writer publishes a grown block
        // before advancing tail, so any position at or below the tail we
        // just observed is present in the block we load here.
        // SAFETY: block pointers stay valid until both halves drop.
        let block = unsafe { &*self.shared.block.load(Ordering::Acquire) };
        for i in 0..n {
            let pos = head + i;
            dst[i as usize] =
                f32::from_bits(block.cells[(pos & block.mask) as usize].load(Ordering::Relaxed));
        }
        self.shared.head.store(head + n, Ordering::Release);
        frames
    }

    /// Slew the read cursor by `frames`. Positive counts discard that many
    /// frames; negative counts rewind, clamped to the free space behind the
    /// cursor. Returns the signed frame count applied.
    pub(crate) fn discard(&mut self, frames: i64) -> i64 {
        let channels = self.shared.channels as u64;
        let head = self.shared.head.load(Ordering::Relaxed);
        let tail = self.shared.tail.load(Ordering::Acquire);
        if frames >= 0 {
            let avail = tail.saturating_sub(head) / channels;
            let k = avail.min(frames as u64);
            self.shared
                .head
                .store(head + k * channels, Ordering::Release);
            k as i64
        } else {
            // SAFETY: block pointers stay valid until both halves drop.
            let block = unsafe { &*self.shared.block.load(Ordering::Acquire) };
            let free = (block.capacity() - tail.saturating_sub(head)) / channels;
            let k = free
                .min(head / channels)
                .min(frames.unsigned_abs());
            self.shared
                .head
                .store(head - k * channels, Ordering::Release);
            -(k as i64)
        }
    }

    /// Live frame count.
    pub(crate) fn len_frames(&self) -> usize {
        len_frames(&self.shared)
    }
}
