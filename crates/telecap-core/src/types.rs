use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BusId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CameraName(pub String);

/// Unit system of every joint on one bus. Mixed-unit buses are rejected at
/// config validation; conversion between buses is always explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JointUnit {
    Radians,
    Degrees,
    Range0To100,
    RawUnits,
}

/// Follower buses command integer milli-degrees.
pub const MILLIDEG_PER_RAD: f64 = 1000.0 * 180.0 / std::f64::consts::PI;

pub fn radians_to_millidegrees(v: f64) -> i32 {
    (v * MILLIDEG_PER_RAD).round() as i32
}

pub fn millidegrees_to_radians(v: i32) -> f64 {
    f64::from(v) / MILLIDEG_PER_RAD
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointSpec {
    pub id: u8,
    /// +1 or -1; mechanical mirroring between leader and follower.
    pub direction_sign: i8,
    pub range_min: i32,
    pub range_max: i32,
    pub homing_offset: i32,
    pub unit: JointUnit,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JointSpecError {
    #[error("direction_sign must be +1 or -1 (got {0})")]
    BadDirectionSign(i8),
    #[error("range_min {min} must be < range_max {max}")]
    EmptyRange { min: i32, max: i32 },
}

impl JointSpec {
    pub fn validate(&self) -> Result<(), JointSpecError> {
        if self.direction_sign != 1 && self.direction_sign != -1 {
            return Err(JointSpecError::BadDirectionSign(self.direction_sign));
        }
        if self.range_min >= self.range_max {
            return Err(JointSpecError::EmptyRange {
                min: self.range_min,
                max: self.range_max,
            });
        }
        Ok(())
    }
}

/// An ordered joint reading or command. Only meaningful together with the
/// bus it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointVector {
    pub bus: BusId,
    pub values: Vec<f32>,
}

impl JointVector {
    pub fn new(bus: impl Into<String>, values: Vec<f32>) -> Self {
        Self {
            bus: BusId(bus.into()),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One captured RGB image, H×W×3 uint8, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFrame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageFrameError {
    #[error("rgb buffer is {got} bytes, expected {want} for {width}x{height}x3")]
    BadLength {
        width: u32,
        height: u32,
        want: usize,
        got: usize,
    },
}

impl ImageFrame {
    pub fn new(width: u32, height: u32, rgb: Vec<u8>) -> Result<Self, ImageFrameError> {
        let want = (width as usize) * (height as usize) * 3;
        if rgb.len() != want {
            return Err(ImageFrameError::BadLength {
                width,
                height,
                want,
                got: rgb.len(),
            });
        }
        Ok(Self { width, height, rgb })
    }

    pub fn byte_len(&self) -> usize {
        self.rgb.len()
    }
}

/// One tick's synchronized sample: joint state, images, and the action that
/// was sent to the follower for this tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame_index: u64,
    pub episode_index: u64,
    pub timestamp: f64,
    pub state: JointVector,
    pub images: BTreeMap<CameraName, ImageFrame>,
    pub action: JointVector,
}

impl Frame {
    /// Timestamps are derived, never sampled: `frame_index / fps`.
    pub fn timestamp_for(frame_index: u64, fps: u32) -> f64 {
        frame_index as f64 / f64::from(fps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millidegree_roundtrip_within_raw_resolution() {
        for v in [-3.1, -0.5, 0.0, 0.001, 1.2345, 2.9] {
            let md = radians_to_millidegrees(v);
            let back = millidegrees_to_radians(md);
            // One raw unit is 0.001 degree; roundtrip error stays below half
            // a unit after the conversion.
            assert!(
                (back - v).abs() <= millidegrees_to_radians(1),
                "v={v} md={md} back={back}"
            );
        }
    }

    #[test]
    fn joint_spec_rejects_zero_sign() {
        let spec = JointSpec {
            id: 0,
            direction_sign: 0,
            range_min: -1000,
            range_max: 1000,
            homing_offset: 0,
            unit: JointUnit::Radians,
        };
        assert_eq!(spec.validate().unwrap_err(), JointSpecError::BadDirectionSign(0));
    }

    #[test]
    fn image_frame_checks_buffer_length() {
        assert!(ImageFrame::new(2, 2, vec![0u8; 12]).is_ok());
        let err = ImageFrame::new(2, 2, vec![0u8; 11]).unwrap_err();
        assert!(matches!(err, ImageFrameError::BadLength { want: 12, got: 11, .. }));
    }

    #[test]
    fn timestamps_are_index_over_fps() {
        assert_eq!(Frame::timestamp_for(0, 30), 0.0);
        assert_eq!(Frame::timestamp_for(30, 30), 1.0);
        assert!((Frame::timestamp_for(1, 30) - 1.0 / 30.0).abs() < 1e-12);
    }
}
