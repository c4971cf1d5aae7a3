//! Microphone capture via cpal.
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It downmixes to mono f32 into a reusable scratch buffer and pushes into the
//! SPSC ring producer; it never locks and only allocates if a device delivers
//! a larger buffer than any before it.
//!
//! `cpal::Stream` is `!Send` on Windows and macOS, so `AudioCapture` must be
//! created and dropped on the same thread (the engine does both inside one
//! `spawn_blocking` closure).

pub mod resample;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

use crate::{
    buffering::AudioProducer,
    error::{HarkError, Result},
};

/// Average interleaved frames of `data` into `out` (mono), converting each
/// sample with `to_f32`.
pub fn downmix_into<T: Copy>(
    data: &[T],
    channels: usize,
    out: &mut Vec<f32>,
    to_f32: impl Fn(T) -> f32,
) {
    let channels = channels.max(1);
    let frames = data.len() / channels;
    out.resize(frames, 0.0);
    for (slot, frame) in out.iter_mut().zip(data.chunks_exact(channels)) {
        let sum: f32 = frame.iter().map(|&s| to_f32(s)).sum();
        *slot = sum / channels as f32;
    }
}

/// Handle to an active capture stream. Not `Send`; see module docs.
pub struct AudioCapture {
    #[cfg(feature = "audio-cpal")]
    _stream: cpal::Stream,
    running: Arc<AtomicBool>,
    /// Native rate reported by the device (Hz).
    pub sample_rate: u32,
}

#[cfg(feature = "audio-cpal")]
fn push_callback<T: cpal::SizedSample + 'static>(
    mut producer: AudioProducer,
    running: Arc<AtomicBool>,
    channels: usize,
    to_f32: fn(T) -> f32,
) -> impl FnMut(&[T], &cpal::InputCallbackInfo) + Send + 'static {
    use crate::buffering::Producer;

    let mut mono: Vec<f32> = Vec::new();
    move |data: &[T], _info| {
        if !running.load(Ordering::Relaxed) {
            return;
        }
        downmix_into(data, channels, &mut mono, to_f32);
        let written = producer.push_slice(&mono);
        if written < mono.len() {
            warn!(dropped = mono.len() - written, "capture ring full");
        }
    }
}

impl AudioCapture {
    /// Open the named input device, else the default one, else the first
    /// available one.
    ///
    /// # Errors
    /// `NoDefaultInputDevice` when no microphone exists; `AudioDevice` /
    /// `AudioStream` when cpal rejects the device or stream.
    #[cfg(feature = "audio-cpal")]
    pub fn open_with_preference(
        producer: AudioProducer,
        running: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
        use cpal::{SampleFormat, StreamConfig};

        let host = cpal::default_host();

        let preferred = preferred_device_name.and_then(|wanted| {
            let found = host
                .input_devices()
                .ok()?
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false));
            if found.is_none() {
                warn!(wanted, "preferred input device not found, falling back");
            }
            found
        });

        let device = match preferred.or_else(|| host.default_input_device()) {
            Some(device) => device,
            None => {
                warn!("no default input device, falling back to first available input");
                host.input_devices()
                    .map_err(|e| HarkError::AudioDevice(e.to_string()))?
                    .next()
                    .ok_or(HarkError::NoDefaultInputDevice)?
            }
        };

        let supported = device
            .default_input_config()
            .map_err(|e| HarkError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(
            device = device.name().unwrap_or_default().as_str(),
            sample_rate,
            channels,
            format = ?supported.sample_format(),
            "opening input device"
        );

        let config: StreamConfig = supported.config();
        let ch = channels as usize;
        let on_error = |err| error!("audio stream error: {err}");
        let flag = Arc::clone(&running);

        let stream = match supported.sample_format() {
            SampleFormat::F32 => device.build_input_stream(
                &config,
                push_callback::<f32>(producer, flag, ch, |s| s),
                on_error,
                None,
            ),
            SampleFormat::I16 => device.build_input_stream(
                &config,
                push_callback::<i16>(producer, flag, ch, |s| s as f32 / 32768.0),
                on_error,
                None,
            ),
            SampleFormat::U8 => device.build_input_stream(
                &config,
                push_callback::<u8>(producer, flag, ch, |s| (s as f32 - 128.0) / 128.0),
                on_error,
                None,
            ),
            fmt => {
                return Err(HarkError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| HarkError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| HarkError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
        })
    }

    #[cfg(not(feature = "audio-cpal"))]
    pub fn open_with_preference(
        _producer: AudioProducer,
        _running: Arc<AtomicBool>,
        _preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        Err(HarkError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    /// Signal the callback to no-op from its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Names of all input devices; empty without the `audio-cpal` feature.
pub fn list_input_devices() -> Vec<String> {
    #[cfg(feature = "audio-cpal")]
    {
        use cpal::traits::{DeviceTrait, HostTrait};

        match cpal::default_host().input_devices() {
            Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
            Err(e) => {
                warn!("failed to list input devices: {e}");
                Vec::new()
            }
        }
    }
    #[cfg(not(feature = "audio-cpal"))]
    {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmix_averages_channels() {
        let mut out = Vec::new();
        downmix_into(&[0.2f32, 0.4, -1.0, 1.0], 2, &mut out, |s| s);
        assert_eq!(out.len(), 2);
        approx::assert_relative_eq!(out[0], 0.3);
        approx::assert_relative_eq!(out[1], 0.0);
    }

    #[test]
    fn downmix_mono_converts_in_place() {
        let mut out = vec![9.0; 8];
        downmix_into(&[i16::MIN, 0, 16384], 1, &mut out, |s| s as f32 / 32768.0);
        assert_eq!(out, vec![-1.0, 0.0, 0.5]);
    }

    #[test]
    fn downmix_ignores_trailing_partial_frame() {
        let mut out = Vec::new();
        downmix_into(&[1u8, 2, 3], 2, &mut out, f32::from);
        assert_eq!(out, vec![1.5]);
    }
}
