//! Microphone capture
//!
//! A dedicated `audio-capture` thread owns the cpal stream for the lifetime
//! of the source. The device callback downmixes and resamples to 16kHz mono,
//! cuts fixed-size frames and hands them to a bounded queue. The device is
//! authoritative: when the consumer falls behind, new frames are dropped and
//! counted, and the gap shows up in the next frame's index.

use crate::audio_buffer::{AudioBuffer, AudioFrame, AudioSample, FRAME_SAMPLES, SAMPLE_RATE};
use crate::error::NodeError;
use async_trait::async_trait;
use cache_padded::CachePadded;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Device-rate samples per resampler call
const RESAMPLE_BLOCK: usize = 1024;

/// Anything that yields frames in production order
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the source has ended for good
    async fn next_frame(&mut self) -> Option<AudioFrame>;

    /// Capture-side counters, for sources backed by a device
    fn capture_stats(&self) -> Option<CaptureStats> {
        None
    }
}

/// Capture options
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Silence gate as percent of full scale; 0 disables it. Leading frames
    /// are held back until one peaks above the threshold.
    pub threshold: f32,

    /// Log every captured frame
    pub verbose: bool,

    /// Frames the queue holds before the device starts dropping
    pub queue_frames: usize,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            verbose: false,
            // ~3 seconds of audio
            queue_frames: 3 * SAMPLE_RATE / FRAME_SAMPLES,
        }
    }
}

/// Counters shared between the capture callback and the consumer
pub struct CaptureCounters {
    produced: CachePadded<AtomicU64>,
    dropped: CachePadded<AtomicU64>,
    gated: CachePadded<AtomicU64>,
}

impl CaptureCounters {
    fn new() -> Self {
        Self {
            produced: CachePadded::new(AtomicU64::new(0)),
            dropped: CachePadded::new(AtomicU64::new(0)),
            gated: CachePadded::new(AtomicU64::new(0)),
        }
    }

    fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            frames_produced: self.produced.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            frames_gated: self.gated.load(Ordering::Relaxed),
        }
    }
}

/// Capture statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_produced: u64,
    /// Produced but not accepted by the queue
    pub frames_dropped: u64,
    /// Held back by the silence gate (not indexed)
    pub frames_gated: u64,
}

/// Stateful conversion from the device rate to 16kHz
///
/// Input is staged until a full block is available, so the filter state and
/// fractional position carry across device callbacks.
struct RateConverter {
    resampler: SincFixedIn<f32>,
    pending: Vec<f32>,
}

impl RateConverter {
    fn new(device_rate: u32) -> Result<Self, NodeError> {
        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };

        let resampler = SincFixedIn::<f32>::new(
            SAMPLE_RATE as f64 / device_rate as f64,
            2.0,
            params,
            RESAMPLE_BLOCK,
            1, // mono
        )
        .map_err(|e| NodeError::DeviceUnavailable(format!("cannot resample {device_rate} Hz: {e}")))?;

        debug!(device_rate, target_rate = SAMPLE_RATE, "Resampler ready");

        Ok(Self {
            resampler,
            pending: Vec::with_capacity(RESAMPLE_BLOCK * 2),
        })
    }

    /// Feed mono samples; returns whatever full blocks produced
    fn process(&mut self, samples: &[AudioSample]) -> Vec<AudioSample> {
        self.pending
            .extend(samples.iter().map(|&s| s as f32 / i16::MAX as f32));

        let mut out = Vec::new();
        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }

            let block: Vec<f32> = self.pending.drain(..needed).collect();
            match self.resampler.process(&[block], None) {
                Ok(waves) => out.extend(
                    waves[0]
                        .iter()
                        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as AudioSample),
                ),
                Err(e) => error!(error = %e, "Resampling failed, block discarded"),
            }
        }
        out
    }
}

/// Turns device callback chunks into indexed frames
struct FrameAssembler {
    buffer: AudioBuffer,
    channels: usize,
    converter: Option<RateConverter>,
    threshold: f32,
    gate_open: bool,
    verbose: bool,
    next_index: u64,
    frames: mpsc::Sender<AudioFrame>,
    counters: Arc<CaptureCounters>,
}

impl FrameAssembler {
    fn new(
        options: &CaptureOptions,
        channels: usize,
        device_rate: u32,
        frames: mpsc::Sender<AudioFrame>,
        counters: Arc<CaptureCounters>,
    ) -> Result<Self, NodeError> {
        let converter = if device_rate as usize == SAMPLE_RATE {
            None
        } else {
            Some(RateConverter::new(device_rate)?)
        };

        Ok(Self {
            buffer: AudioBuffer::new(),
            channels: channels.max(1),
            converter,
            threshold: options.threshold,
            gate_open: options.threshold <= 0.0,
            verbose: options.verbose,
            next_index: 0,
            frames,
            counters,
        })
    }

    fn push(&mut self, interleaved: &[AudioSample]) {
        let mono = downmix(interleaved, self.channels);
        let samples = match self.converter.as_mut() {
            Some(converter) => converter.process(&mono),
            None => mono,
        };

        self.buffer.write(&samples);
        while let Some(frame) = self.buffer.next_frame() {
            self.emit(frame);
        }
    }

    fn emit(&mut self, samples: Vec<AudioSample>) {
        let frame = AudioFrame::new(self.next_index, samples);

        if !self.gate_open {
            if frame.peak_percent() <= self.threshold {
                self.counters.gated.fetch_add(1, Ordering::Relaxed);
                return;
            }
            self.gate_open = true;
            info!(threshold = self.threshold, "Silence gate opened");
        }

        if self.verbose {
            debug!(index = frame.index, peak = frame.peak_percent(), "Captured frame");
        }

        self.next_index += 1;
        self.counters.produced.fetch_add(1, Ordering::Relaxed);

        match self.frames.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(index = frame.index, dropped, "Frame queue full, dropping frame");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// Live microphone source
pub struct AudioSource {
    frames: mpsc::Receiver<AudioFrame>,
    counters: Arc<CaptureCounters>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AudioSource {
    /// Open the default input device and start producing frames
    pub async fn start(options: CaptureOptions) -> Result<Self, NodeError> {
        let (tx, rx) = mpsc::channel(options.queue_frames.max(1));
        let counters = Arc::new(CaptureCounters::new());
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), NodeError>>();

        let thread_counters = Arc::clone(&counters);
        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                // cpal streams are not Send; the stream lives and dies here
                let stream = match open_stream(&options, tx, thread_counters) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                while !thread_stop.load(Ordering::Relaxed) {
                    std::thread::park_timeout(Duration::from_millis(200));
                }

                drop(stream);
                info!("Audio capture stopped");
            })
            .map_err(|e| NodeError::DeviceUnavailable(format!("failed to spawn capture thread: {e}")))?;

        match ready_rx.await {
            Ok(Ok(())) => {
                info!("Audio capture started");
                Ok(Self {
                    frames: rx,
                    counters,
                    stop,
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                // The thread returns right after reporting; it is left to exit
                drop(thread);
                Err(e)
            }
            Err(_) => Err(NodeError::DeviceUnavailable(
                "capture thread exited during startup".to_string(),
            )),
        }
    }

    /// Stop capturing. The source cannot be restarted.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                error!("Audio capture thread panicked");
            }
        }
    }
}

impl Drop for AudioSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl FrameSource for AudioSource {
    async fn next_frame(&mut self) -> Option<AudioFrame> {
        self.frames.recv().await
    }

    fn capture_stats(&self) -> Option<CaptureStats> {
        Some(self.counters.snapshot())
    }
}

fn open_stream(
    options: &CaptureOptions,
    frames: mpsc::Sender<AudioFrame>,
    counters: Arc<CaptureCounters>,
) -> Result<cpal::Stream, NodeError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| NodeError::DeviceUnavailable("no audio input device available".to_string()))?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let supported = device
        .default_input_config()
        .map_err(|e| NodeError::DeviceUnavailable(format!("failed to query {name}: {e}")))?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.config();

    info!(
        device = %name,
        sample_rate = config.sample_rate.0,
        channels = config.channels,
        format = ?sample_format,
        "Opening capture device"
    );

    let mut assembler = FrameAssembler::new(
        options,
        config.channels as usize,
        config.sample_rate.0,
        frames,
        counters,
    )?;
    let on_error = |err: cpal::StreamError| {
        error!(error = %err, "Audio capture error");
    };

    let stream = match sample_format {
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| assembler.push(data),
            on_error,
            None,
        ),
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let converted: Vec<i16> = data
                    .iter()
                    .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                    .collect();
                assembler.push(&converted);
            },
            on_error,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                let converted: Vec<i16> = data.iter().map(|&s| (s as i32 - 32768) as i16).collect();
                assembler.push(&converted);
            },
            on_error,
            None,
        ),
        other => {
            return Err(NodeError::DeviceUnavailable(format!(
                "unsupported sample format {:?}",
                other
            )));
        }
    }
    .map_err(|e| NodeError::DeviceUnavailable(format!("failed to build input stream: {e}")))?;

    stream
        .play()
        .map_err(|e| NodeError::DeviceUnavailable(format!("failed to start audio stream: {e}")))?;

    Ok(stream)
}

/// Average interleaved channels down to mono
fn downmix(data: &[AudioSample], channels: usize) -> Vec<AudioSample> {
    if channels <= 1 {
        return data.to_vec();
    }

    data.chunks(channels)
        .map(|chunk| {
            let sum: i32 = chunk.iter().map(|&s| s as i32).sum();
            (sum / chunk.len() as i32) as i16
        })
        .collect()
}
