//! Role-tagged audio capture.
//!
//! Each role gets a dedicated capture thread owning its cpal stream
//! (streams are not `Send`). The stream callback does no work beyond
//! mixdown and a non-blocking channel push; everything else happens in
//! the session's pipeline task.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::SampleFormat;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::device::find_input_device;
use super::resampler::mix_to_mono;
use crate::error::DeviceError;
use crate::events::Role;

/// One chunk of captured audio, already mixed to mono but still at the
/// device's native rate. Ephemeral: produced continuously, consumed
/// immediately, never persisted.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub role: Role,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub captured_at: Instant,
}

/// Owns one capture thread; dropping or stopping it releases the
/// device handle.
pub struct CaptureHandle {
    role: Role,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CaptureHandle {
    pub fn role(&self) -> Role {
        self.role
    }

    /// Stop the capture thread and release the device. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open a capture stream for one role and start pumping frames into
/// `tx`. Frames are dropped (not buffered) while `active` is false or
/// when the channel is full; capture never blocks on a slow consumer.
pub fn start_capture(
    role: Role,
    device_name: Option<String>,
    active: Arc<AtomicBool>,
    tx: mpsc::Sender<AudioFrame>,
) -> Result<CaptureHandle, DeviceError> {
    let stop = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), DeviceError>>();

    let thread_stop = stop.clone();
    let thread = std::thread::Builder::new()
        .name(format!("capture-{}", role.label()))
        .spawn(move || {
            run_capture_thread(role, device_name, active, tx, thread_stop, ready_tx);
        })
        .map_err(|e| DeviceError::Stream {
            name: role.label().to_string(),
            reason: e.to_string(),
        })?;

    // The thread reports back once the stream is playing (or failed).
    match ready_rx.recv_timeout(Duration::from_secs(10)) {
        Ok(Ok(())) => Ok(CaptureHandle {
            role,
            stop,
            thread: Some(thread),
        }),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => {
            stop.store(true, Ordering::SeqCst);
            Err(DeviceError::Stream {
                name: role.label().to_string(),
                reason: "timed out waiting for capture stream to start".to_string(),
            })
        }
    }
}

fn run_capture_thread(
    role: Role,
    device_name: Option<String>,
    active: Arc<AtomicBool>,
    tx: mpsc::Sender<AudioFrame>,
    stop: Arc<AtomicBool>,
    ready_tx: std_mpsc::Sender<Result<(), DeviceError>>,
) {
    let device = match find_input_device(device_name.as_deref()) {
        Ok(d) => d,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let device_label = device
        .name()
        .unwrap_or_else(|_| device_name.clone().unwrap_or_else(|| "default".into()));

    let supported = match device.default_input_config() {
        Ok(c) => c,
        Err(e) => {
            let _ = ready_tx.send(Err(DeviceError::Unsupported {
                name: device_label,
                reason: e.to_string(),
            }));
            return;
        }
    };
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.config();
    let channels = config.channels;
    let sample_rate = config.sample_rate.0;

    let dropped = Arc::new(AtomicU64::new(0));
    let err_label = device_label.clone();
    let err_fn = move |e: cpal::StreamError| {
        error!("capture stream error on '{}': {}", err_label, e);
    };

    let push = {
        let dropped = dropped.clone();
        move |samples: Vec<f32>| {
            if !active.load(Ordering::Relaxed) {
                return;
            }
            let frame = AudioFrame {
                role,
                samples,
                sample_rate,
                captured_at: Instant::now(),
            };
            if tx.try_send(frame).is_err() {
                // Consumer is behind; dropping keeps the callback
                // non-blocking and latency bounded.
                let count = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if count % 100 == 1 {
                    warn!("capture channel full, dropped {} chunks ({})", count, role.label());
                }
            }
        }
    };

    let stream = match sample_format {
        SampleFormat::F32 => {
            let push = push.clone();
            device.build_input_stream(
                &config,
                move |data: &[f32], _| push(mix_to_mono(data, channels)),
                err_fn.clone(),
                None,
            )
        }
        SampleFormat::I16 => {
            let push = push.clone();
            device.build_input_stream(
                &config,
                move |data: &[i16], _| {
                    let floats: Vec<f32> =
                        data.iter().map(|s| *s as f32 / i16::MAX as f32).collect();
                    push(mix_to_mono(&floats, channels))
                },
                err_fn.clone(),
                None,
            )
        }
        other => {
            let _ = ready_tx.send(Err(DeviceError::Unsupported {
                name: device_label,
                reason: format!("unsupported sample format {:?}", other),
            }));
            return;
        }
    };

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(DeviceError::Stream {
                name: device_label,
                reason: e.to_string(),
            }));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(DeviceError::Stream {
            name: device_label,
            reason: e.to_string(),
        }));
        return;
    }

    info!(
        "capture started for {} on '{}' ({} Hz, {} ch, {:?})",
        role.label(),
        device_label,
        sample_rate,
        channels,
        sample_format
    );
    let _ = ready_tx.send(Ok(()));

    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(50));
    }

    drop(stream);
    debug!("capture stopped for {}", role.label());
}
