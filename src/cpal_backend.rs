//! CPAL rendition of the [`AudioBackend`] capability.
//!
//! CPAL streams are not `Send`, so each direction runs on a dedicated
//! worker thread that owns the stream and takes commands over a channel.
//! `playback_stop`/`record_stop` join the worker, which guarantees no
//! callback runs after they return.
//!
//! CPAL exposes no volume, mute, or latency reporting; those capabilities
//! are simply absent.

use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};

use crate::device::{AudioBackend, PullFn, PushFn};

/// Preferred period size when the device offers a range.
const DEFAULT_PERIOD_FRAMES: usize = 1024;

enum WorkerCmd {
    Start,
    Shutdown,
}

struct StreamWorker {
    cmd_tx: Sender<WorkerCmd>,
    done_rx: Receiver<()>,
    join: Option<JoinHandle<()>>,
}

impl StreamWorker {
    fn start(&self) {
        let _ = self.cmd_tx.send(WorkerCmd::Start);
    }

    /// Drop the stream on the worker thread and wait for it; callbacks are
    /// guaranteed finished afterwards.
    fn shutdown(mut self) {
        let _ = self.cmd_tx.send(WorkerCmd::Shutdown);
        let _ = self.done_rx.recv();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Audio back-end built on the platform's default CPAL host.
#[derive(Default)]
pub struct CpalBackend {
    available: bool,
    playback: Option<StreamWorker>,
    record: Option<StreamWorker>,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioBackend for CpalBackend {
    fn init(&mut self) -> bool {
        let host = cpal::default_host();
        self.available =
            host.default_output_device().is_some() || host.default_input_device().is_some();
        self.available
    }

    fn name(&self) -> &'static str {
        "cpal"
    }

    fn supports_playback(&self) -> bool {
        self.available && cpal::default_host().default_output_device().is_some()
    }

    fn supports_record(&self) -> bool {
        self.available && cpal::default_host().default_input_device().is_some()
    }

    fn playback_setup(
        &mut self,
        channels: usize,
        sample_rate: u32,
        pull: PullFn,
    ) -> Result<usize> {
        if let Some(worker) = self.playback.take() {
            worker.shutdown();
        }

        let (cmd_tx, cmd_rx) = bounded(2);
        let (ready_tx, ready_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(1);
        let join = std::thread::Builder::new()
            .name("cpal-playback".into())
            .spawn(move || playback_worker(channels, sample_rate, pull, cmd_rx, ready_tx, done_tx))
            .context("spawn playback worker")?;

        let worker = StreamWorker {
            cmd_tx,
            done_rx,
            join: Some(join),
        };
        match ready_rx.recv().context("playback worker exited early")? {
            Ok(max_period) => {
                self.playback = Some(worker);
                Ok(max_period)
            }
            Err(e) => {
                worker.shutdown();
                Err(e)
            }
        }
    }

    fn playback_start(&mut self) -> Result<()> {
        match &self.playback {
            Some(worker) => {
                worker.start();
                Ok(())
            }
            None => Err(anyhow!("playback not set up")),
        }
    }

    fn playback_stop(&mut self) {
        if let Some(worker) = self.playback.take() {
            worker.shutdown();
        }
    }

    fn record_start(&mut self, channels: usize, sample_rate: u32, push: PushFn) -> Result<()> {
        if let Some(worker) = self.record.take() {
            worker.shutdown();
        }

        let (cmd_tx, cmd_rx) = bounded(1);
        let (ready_tx, ready_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(1);
        let join = std::thread::Builder::new()
            .name("cpal-record".into())
            .spawn(move || record_worker(channels, sample_rate, push, cmd_rx, ready_tx, done_tx))
            .context("spawn record worker")?;

        let worker = StreamWorker {
            cmd_tx,
            done_rx,
            join: Some(join),
        };
        match ready_rx.recv().context("record worker exited early")? {
            Ok(()) => {
                self.record = Some(worker);
                Ok(())
            }
            Err(e) => {
                worker.shutdown();
                Err(e)
            }
        }
    }

    fn record_stop(&mut self) {
        if let Some(worker) = self.record.take() {
            worker.shutdown();
        }
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        self.playback_stop();
        self.record_stop();
    }
}

fn playback_worker(
    channels: usize,
    sample_rate: u32,
    pull: PullFn,
    cmd_rx: Receiver<WorkerCmd>,
    ready_tx: Sender<Result<usize>>,
    done_tx: Sender<()>,
) {
    let (stream, max_period) = match build_playback_stream(channels, sample_rate, pull) {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            let _ = done_tx.send(());
            return;
        }
    };
    let _ = ready_tx.send(Ok(max_period));

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            WorkerCmd::Start => {
                if let Err(e) = stream.play() {
                    tracing::error!("playback stream play failed: {e}");
                }
            }
            WorkerCmd::Shutdown => break,
        }
    }
    drop(stream);
    let _ = done_tx.send(());
}

fn build_playback_stream(
    channels: usize,
    sample_rate: u32,
    mut pull: PullFn,
) -> Result<(cpal::Stream, usize)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow!("no default output device"))?;
    tracing::info!(
        device = %device.name().unwrap_or_else(|_| "unknown".into()),
        "cpal playback device"
    );

    let supported = device
        .supported_output_configs()
        .context("query output configs")?
        .filter(|c| {
            c.channels() as usize == channels && c.sample_format() == cpal::SampleFormat::F32
        })
        .find(|c| c.min_sample_rate().0 <= sample_rate && sample_rate <= c.max_sample_rate().0)
        .ok_or_else(|| anyhow!("no f32 output config for {channels} ch at {sample_rate} Hz"))?;

    let period = match supported.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            DEFAULT_PERIOD_FRAMES.clamp(*min as usize, (*max as usize).max(*min as usize))
        }
        cpal::SupportedBufferSize::Unknown => DEFAULT_PERIOD_FRAMES,
    };
    let config = StreamConfig {
        channels: channels as u16,
        sample_rate: SampleRate(sample_rate),
        buffer_size: BufferSize::Fixed(period as u32),
    };

    let err_fn = |err| tracing::warn!("stream error: {err}");
    let stream = device
        .build_output_stream(
            &config,
            // The engine's pull fills what it has and silences the rest.
            move |data: &mut [f32], _| {
                pull(data);
            },
            err_fn,
            None,
        )
        .context("build output stream")?;
    // Hold the stream until the engine's priming threshold starts it.
    let _ = stream.pause();
    Ok((stream, period))
}

fn record_worker(
    channels: usize,
    sample_rate: u32,
    push: PushFn,
    cmd_rx: Receiver<WorkerCmd>,
    ready_tx: Sender<Result<()>>,
    done_tx: Sender<()>,
) {
    let stream = match build_record_stream(channels, sample_rate, push) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            let _ = done_tx.send(());
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(anyhow!("record stream play failed: {e}")));
        drop(stream);
        let _ = done_tx.send(());
        return;
    }
    let _ = ready_tx.send(Ok(()));

    while let Ok(cmd) = cmd_rx.recv() {
        if let WorkerCmd::Shutdown = cmd {
            break;
        }
    }
    drop(stream);
    let _ = done_tx.send(());
}

fn build_record_stream(
    channels: usize,
    sample_rate: u32,
    mut push: PushFn,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| anyhow!("no default input device"))?;
    tracing::info!(
        device = %device.name().unwrap_or_else(|_| "unknown".into()),
        "cpal record device"
    );

    let config = StreamConfig {
        channels: channels as u16,
        sample_rate: SampleRate(sample_rate),
        buffer_size: BufferSize::Default,
    };
    let err_fn = |err| tracing::warn!("stream error: {err}");

    let native_i16 = device
        .supported_input_configs()
        .context("query input configs")?
        .filter(|c| {
            c.channels() as usize == channels && c.sample_format() == cpal::SampleFormat::I16
        })
        .any(|c| c.min_sample_rate().0 <= sample_rate && sample_rate <= c.max_sample_rate().0);

    let stream = if native_i16 {
        let mut scratch: Vec<u8> = Vec::new();
        device.build_input_stream(
            &config,
            move |data: &[i16], _| {
                scratch.clear();
                scratch.extend(data.iter().flat_map(|s| s.to_le_bytes()));
                push(&scratch, data.len() / channels);
            },
            err_fn,
            None,
        )
    } else {
        // Fall back to the device's float format and quantise to s16le.
        let mut scratch: Vec<u8> = Vec::new();
        device.build_input_stream(
            &config,
            move |data: &[f32], _| {
                scratch.clear();
                scratch.extend(data.iter().flat_map(|s| {
                    ((s.clamp(-1.0, 1.0) * 32_767.0) as i16).to_le_bytes()
                }));
                push(&scratch, data.len() / channels);
            },
            err_fn,
            None,
        )
    }
    .context("build input stream")?;

    Ok(stream)
}
