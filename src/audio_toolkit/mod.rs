// Re-export all audio components
pub mod capture;
pub mod device;
pub mod resampler;
pub mod utils;
pub mod vad;

pub use capture::{start_capture, AudioFrame, CaptureHandle};
pub use device::{find_input_device, list_input_devices, CpalDeviceInfo};
pub use resampler::FrameResampler;
pub use utils::save_wav_file;
