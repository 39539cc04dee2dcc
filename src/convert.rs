//! Input sample-format conversion.
//!
//! The bridge currently accepts signed 16-bit little-endian interleaved PCM
//! only; the conversion step is keyed by [`SourceFormat`] so further formats
//! extend the dispatch without touching the clock-recovery core.

/// Wire format of submitted source audio.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum SourceFormat {
    /// Signed 16-bit little-endian interleaved.
    S16Le,
    /// 32-bit float little-endian interleaved (not currently supported).
    F32Le,
}

impl SourceFormat {
    /// Bytes per sample on the wire.
    pub fn sample_bytes(self) -> usize {
        match self {
            SourceFormat::S16Le => 2,
            SourceFormat::F32Le => 4,
        }
    }
}

pub(crate) type Converter = fn(&[u8], &mut [f32]);

/// Conversion routine for `format`, or `None` when the format is
/// unsupported.
pub(crate) fn converter_for(format: SourceFormat) -> Option<Converter> {
    match format {
        SourceFormat::S16Le => Some(s16le_to_f32),
        SourceFormat::F32Le => None,
    }
}

fn s16le_to_f32(src: &[u8], dst: &mut [f32]) {
    debug_assert_eq!(src.len() / 2, dst.len());
    for (bytes, out) in src.chunks_exact(2).zip(dst.iter_mut()) {
        let sample = i16::from_le_bytes([bytes[0], bytes[1]]);
        *out = f32::from(sample) / 32_768.0;
    }
}
