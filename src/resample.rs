//! Streaming sample-rate conversion at a per-period ratio.
//!
//! Wraps Rubato's async sinc resampler. The engine rebuilds the wrapper
//! whenever the source period size changes (a rare event), so each submit
//! processes exactly one input chunk; the ratio moves a little every period
//! as the latency controller trims buffered offset.

use anyhow::{anyhow, Context, Result};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    calculate_cutoff, Adjustable, Async, FixedAsync, Indexing,
    SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::ring::AudioWriter;

/// The controller's excursions stay below ±0.1%; anything past this bound is
/// a bug upstream, and it also sizes the output scratch.
const MAX_RATIO_RELATIVE: f64 = 1.1;

pub(crate) struct StreamResampler {
    inner: Box<dyn Adjustable<f32>>,
    channels: usize,
    chunk_frames: usize,
    frames_out: Vec<f32>,
}

impl StreamResampler {
    /// Build a resampler consuming fixed chunks of `chunk_frames` frames.
    pub(crate) fn new(channels: usize, chunk_frames: usize) -> Result<Self> {
        let sinc_len = 128;
        let oversampling_factor = 256;
        let interpolation = SincInterpolationType::Cubic;
        let window = WindowFunction::BlackmanHarris2;
        let f_cutoff = calculate_cutoff::<f32>(sinc_len, window);

        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: Some(f_cutoff),
            interpolation,
            oversampling_factor,
            window,
        };

        let inner: Box<dyn Adjustable<f32>> = Box::new(
            Async::<f32>::new_sinc(
                1.0,
                MAX_RATIO_RELATIVE,
                &params,
                chunk_frames.max(1),
                channels,
                FixedAsync::Input,
            )
            .context("create sinc resampler")?,
        );

        let frames_out = vec![0.0f32; inner.output_frames_max() * channels];
        Ok(Self {
            inner,
            channels,
            chunk_frames: chunk_frames.max(1),
            frames_out,
        })
    }

    /// Resample one period of interleaved input at `ratio` and append the
    /// output to the ring. Returns the total output frames generated.
    pub(crate) fn process(
        &mut self,
        input: &[f32],
        ratio: f64,
        writer: &mut AudioWriter,
    ) -> Result<usize> {
        debug_assert_eq!(input.len() % self.channels, 0);
        let frames = input.len() / self.channels;

        self.inner
            .set_resample_ratio(ratio, true)
            .context("set resample ratio")?;

        let out_capacity = self.frames_out.len() / self.channels;
        let mut indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len: None,
        };

        let mut consumed = 0usize;
        let mut generated = 0usize;
        while consumed < frames {
            let remaining = frames - consumed;
            let input_adapter =
                InterleavedSlice::new(&input[consumed * self.channels..], self.channels, remaining)
                    .map_err(|e| anyhow!("interleaved slice (input): {e}"))?;
            let mut output_adapter =
                InterleavedSlice::new_mut(&mut self.frames_out, self.channels, out_capacity)
                    .map_err(|e| anyhow!("interleaved slice (output): {e}"))?;

            indexing.partial_len = if remaining < self.chunk_frames {
                Some(remaining)
            } else {
                None
            };

            let (used, produced) = self
                .inner
                .process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing))
                .context("resampler process")?;

            writer.append(&self.frames_out[..produced * self.channels]);
            generated += produced;
            consumed += used.max(1);
        }

        Ok(generated)
    }
}
