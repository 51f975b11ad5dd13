//! Device adapter seams.
//!
//! The wire protocols behind these traits (serial register maps, CAN frame
//! layouts, V4L capture) are out of scope; real drivers implement the same
//! traits. The simulated variants below are deterministic stand-ins used by
//! tests and bring-up.

use telecap_core::types::ImageFrame;

use crate::NodeError;

/// A motor bus: one serial/CAN link carrying every joint of one arm.
///
/// Positions are raw integer device units; the owning node performs the
/// explicit unit conversion for its bus.
pub trait MotorBus: Send {
    fn open(&mut self) -> Result<(), NodeError>;
    fn read_positions(&mut self) -> Result<Vec<i32>, NodeError>;
    fn write_positions(&mut self, targets: &[i32]) -> Result<(), NodeError>;
    /// Releases the underlying port. Must be safe to call more than once.
    fn close(&mut self);
}

/// An image-capture device.
pub trait Camera: Send {
    fn open(&mut self) -> Result<(), NodeError>;
    fn capture(&mut self) -> Result<ImageFrame, NodeError>;
    fn close(&mut self);
}

/// Reads positions with a bounded retry; transient bus glitches are common
/// on shared serial links.
pub fn read_positions_retry(bus: &mut dyn MotorBus, attempts: u32) -> Result<Vec<i32>, NodeError> {
    let mut last = None;
    for attempt in 1..=attempts {
        match bus.read_positions() {
            Ok(values) => return Ok(values),
            Err(err) => {
                tracing::debug!(attempt, error = %err, "position read failed");
                last = Some(err);
            }
        }
    }
    Err(last.unwrap_or_else(|| NodeError::Device("position read failed".to_string())))
}

/// Deterministic joint source: a slow sine sweep per joint, in raw units.
pub struct SimMotorBus {
    name: String,
    joints: usize,
    tick: u64,
    open: bool,
    last_command: Option<Vec<i32>>,
}

impl SimMotorBus {
    pub fn new(name: impl Into<String>, joints: usize) -> Self {
        Self {
            name: name.into(),
            joints,
            tick: 0,
            open: false,
            last_command: None,
        }
    }

    pub fn last_command(&self) -> Option<&[i32]> {
        self.last_command.as_deref()
    }
}

impl MotorBus for SimMotorBus {
    fn open(&mut self) -> Result<(), NodeError> {
        self.open = true;
        tracing::info!(bus = %self.name, joints = self.joints, "sim motor bus opened");
        Ok(())
    }

    fn read_positions(&mut self) -> Result<Vec<i32>, NodeError> {
        if !self.open {
            return Err(NodeError::Device(format!("{} is not open", self.name)));
        }
        self.tick += 1;
        let t = self.tick as f64 / 30.0;
        Ok((0..self.joints)
            .map(|j| ((t + j as f64).sin() * 200.0) as i32)
            .collect())
    }

    fn write_positions(&mut self, targets: &[i32]) -> Result<(), NodeError> {
        if !self.open {
            return Err(NodeError::Device(format!("{} is not open", self.name)));
        }
        self.last_command = Some(targets.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            tracing::info!(bus = %self.name, "sim motor bus released");
        }
    }
}

/// Deterministic camera: a moving gradient at a fixed resolution.
pub struct SimCamera {
    name: String,
    width: u32,
    height: u32,
    tick: u64,
    open: bool,
}

impl SimCamera {
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            tick: 0,
            open: false,
        }
    }
}

impl Camera for SimCamera {
    fn open(&mut self) -> Result<(), NodeError> {
        self.open = true;
        tracing::info!(camera = %self.name, width = self.width, height = self.height, "sim camera opened");
        Ok(())
    }

    fn capture(&mut self) -> Result<ImageFrame, NodeError> {
        if !self.open {
            return Err(NodeError::Device(format!("{} is not open", self.name)));
        }
        self.tick += 1;
        let shift = (self.tick % 256) as u8;
        let mut rgb = Vec::with_capacity((self.width * self.height * 3) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                rgb.push((x as u8).wrapping_add(shift));
                rgb.push((y as u8).wrapping_add(shift));
                rgb.push(shift);
            }
        }
        ImageFrame::new(self.width, self.height, rgb)
            .map_err(|e| NodeError::Device(e.to_string()))
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            tracing::info!(camera = %self.name, "sim camera released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_bus_requires_open() {
        let mut bus = SimMotorBus::new("leader", 7);
        assert!(bus.read_positions().is_err());
        bus.open().unwrap();
        assert_eq!(bus.read_positions().unwrap().len(), 7);
        bus.close();
        assert!(bus.read_positions().is_err());
    }

    #[test]
    fn retry_surfaces_last_error() {
        struct FlakyBus {
            fails_left: u32,
        }
        impl MotorBus for FlakyBus {
            fn open(&mut self) -> Result<(), NodeError> {
                Ok(())
            }
            fn read_positions(&mut self) -> Result<Vec<i32>, NodeError> {
                if self.fails_left > 0 {
                    self.fails_left -= 1;
                    Err(NodeError::Device("checksum".to_string()))
                } else {
                    Ok(vec![1, 2, 3])
                }
            }
            fn write_positions(&mut self, _targets: &[i32]) -> Result<(), NodeError> {
                Ok(())
            }
            fn close(&mut self) {}
        }

        let mut bus = FlakyBus { fails_left: 2 };
        assert_eq!(read_positions_retry(&mut bus, 3).unwrap(), vec![1, 2, 3]);

        let mut bus = FlakyBus { fails_left: 5 };
        assert!(read_positions_retry(&mut bus, 3).is_err());
    }

    #[test]
    fn sim_camera_produces_full_frames() {
        let mut cam = SimCamera::new("top", 8, 6);
        cam.open().unwrap();
        let frame = cam.capture().unwrap();
        assert_eq!(frame.byte_len(), 8 * 6 * 3);
    }
}
