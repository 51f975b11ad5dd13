//! External video encoder.
//!
//! Encoding shells out to `ffmpeg`. The hardware path uses the SoC encoder
//! and falls back to software when its channels are exhausted; both failing
//! is fatal for the episode.

use std::path::Path;
use std::process::Command;

use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("ffmpeg exited with status {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
    #[error("both hardware and software encoders failed: {hardware} / {software}")]
    FallbackExhausted { hardware: String, software: String },
    #[error("io error running ffmpeg: {0}")]
    Io(#[from] std::io::Error),
}

/// Encodes one directory of `frame_*.png` into one MP4.
pub trait VideoEncoder: Send + Sync {
    fn encode_frames(&self, images_dir: &Path, output: &Path, fps: u32) -> Result<(), EncoderError>;
}

const SOFTWARE_CODEC: &str = "libx264";
const HARDWARE_CODEC: &str = "h264_rkmpp";

pub struct FfmpegEncoder {
    hardware: bool,
}

impl FfmpegEncoder {
    pub fn new(hardware: bool) -> Self {
        Self { hardware }
    }

    fn run_ffmpeg(images_dir: &Path, output: &Path, fps: u32, codec: &str) -> Result<(), EncoderError> {
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let output_status = Command::new("ffmpeg")
            .current_dir(images_dir)
            .arg("-y")
            .args(["-framerate", &fps.to_string()])
            .args(["-pattern_type", "glob"])
            .args(["-i", "*.png"])
            .args(["-c:v", codec])
            .args(["-pix_fmt", "yuv420p"])
            .arg(output)
            .output()?;

        if output_status.status.success() {
            Ok(())
        } else {
            Err(EncoderError::Failed {
                code: output_status.status.code(),
                stderr: String::from_utf8_lossy(&output_status.stderr)
                    .chars()
                    .take(2000)
                    .collect(),
            })
        }
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn encode_frames(&self, images_dir: &Path, output: &Path, fps: u32) -> Result<(), EncoderError> {
        if !self.hardware {
            return Self::run_ffmpeg(images_dir, output, fps, SOFTWARE_CODEC);
        }

        match Self::run_ffmpeg(images_dir, output, fps, HARDWARE_CODEC) {
            Ok(()) => {
                info!(output = %output.display(), codec = HARDWARE_CODEC, "hardware encode done");
                Ok(())
            }
            Err(hw_err) => {
                // Channel exhaustion and most other hardware faults present
                // as a failed ffmpeg run; software still produces the video.
                warn!(error = %hw_err, "hardware encoder failed, falling back to software");
                Self::run_ffmpeg(images_dir, output, fps, SOFTWARE_CODEC).map_err(|sw_err| {
                    EncoderError::FallbackExhausted {
                        hardware: hw_err.to_string(),
                        software: sw_err.to_string(),
                    }
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Test double that records calls; the real thing shells out to ffmpeg.
    pub struct StubEncoder {
        pub calls: AtomicU32,
        pub outputs: Mutex<Vec<PathBuf>>,
        pub fail: bool,
    }

    impl StubEncoder {
        pub fn new(fail: bool) -> Self {
            Self {
                calls: AtomicU32::new(0),
                outputs: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    impl VideoEncoder for StubEncoder {
        fn encode_frames(
            &self,
            _images_dir: &Path,
            output: &Path,
            _fps: u32,
        ) -> Result<(), EncoderError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                return Err(EncoderError::Failed {
                    code: Some(1),
                    stderr: "stub failure".to_string(),
                });
            }
            if let Some(parent) = output.parent() {
                std::fs::create_dir_all(parent).map_err(EncoderError::Io)?;
            }
            std::fs::write(output, b"mp4").map_err(EncoderError::Io)?;
            self.outputs.lock().unwrap().push(output.to_path_buf());
            Ok(())
        }
    }

    #[test]
    fn stub_encoder_writes_marker_files() {
        let encoder = StubEncoder::new(false);
        let mut out = std::env::temp_dir();
        out.push(format!(
            "telecap-encoder-{}-{}.mp4",
            std::process::id(),
            telecap_observe::time::unix_time_ms()
        ));
        encoder
            .encode_frames(Path::new("/nonexistent"), &out, 30)
            .unwrap();
        assert!(out.exists());
        std::fs::remove_file(out).unwrap();
        assert_eq!(encoder.calls.load(Ordering::Relaxed), 1);
    }
}
