//! Leader and follower arm nodes.
//!
//! The leader bus reports raw encoder ticks; the node converts to radians
//! (the leader adapter contract) and smooths sensor noise with a low-pass
//! filter before publishing. The follower bus speaks integer milli-degrees;
//! the node republishes its state in radians and executes incoming action
//! commands at no more than the bus period.

use std::time::{Duration, Instant};

use telecap_core::topic;
use telecap_core::types::{millidegrees_to_radians, JointSpec};
use telecap_wire::Payload;

use crate::adapter::{read_positions_retry, MotorBus};
use crate::runtime::{Node, Output};
use crate::NodeError;

/// Encoder resolution of the leader servos.
const LEADER_TICKS_PER_REV: f64 = 4096.0;
const RAD_PER_TICK: f64 = std::f64::consts::TAU / LEADER_TICKS_PER_REV;

/// Smoothing factor for the leader low-pass filter.
const LEADER_FILTER_ALPHA: f32 = 0.2;

pub const POSITION_READ_ATTEMPTS: u32 = 3;

pub struct LeaderNode {
    bus: Box<dyn MotorBus>,
    specs: Vec<JointSpec>,
    filtered: Option<Vec<f32>>,
}

impl LeaderNode {
    pub fn new(bus: Box<dyn MotorBus>, specs: Vec<JointSpec>) -> Self {
        Self {
            bus,
            specs,
            filtered: None,
        }
    }

    fn ticks_to_radians(&self, raw: &[i32]) -> Vec<f32> {
        raw.iter()
            .enumerate()
            .map(|(i, &v)| {
                let homing = self.specs.get(i).map(|s| s.homing_offset).unwrap_or(0);
                ((f64::from(v - homing)) * RAD_PER_TICK) as f32
            })
            .collect()
    }

    fn smooth(&mut self, current: Vec<f32>) -> Vec<f32> {
        match self.filtered.as_mut() {
            Some(prev) if prev.len() == current.len() => {
                for (p, c) in prev.iter_mut().zip(current.iter()) {
                    *p = LEADER_FILTER_ALPHA * c + (1.0 - LEADER_FILTER_ALPHA) * *p;
                }
                prev.clone()
            }
            _ => {
                self.filtered = Some(current.clone());
                current
            }
        }
    }
}

impl Node for LeaderNode {
    fn name(&self) -> &str {
        "arm-leader"
    }

    fn on_start(&mut self) -> Result<(), NodeError> {
        self.bus.open()
    }

    fn on_tick(&mut self) -> Result<Vec<Output>, NodeError> {
        let raw = read_positions_retry(self.bus.as_mut(), POSITION_READ_ATTEMPTS)?;
        let radians = self.ticks_to_radians(&raw);
        let smoothed = self.smooth(radians);
        Ok(vec![Output::new(
            topic::JOINT_LEADER,
            Payload::Vector {
                name: "leader".to_string(),
                values: smoothed,
            },
        )])
    }

    fn on_input(&mut self, _topic: &str, _payload: &Payload) -> Result<Vec<Output>, NodeError> {
        Ok(Vec::new())
    }

    fn on_stop(&mut self) {
        self.bus.close();
    }
}

pub struct FollowerNode {
    bus: Box<dyn MotorBus>,
    /// Milli-degree home pose commanded once on startup so teleoperation
    /// never begins from an arbitrary pose.
    safe_home: Vec<i32>,
    min_write_gap: Duration,
    last_write: Option<Instant>,
}

impl FollowerNode {
    pub fn new(bus: Box<dyn MotorBus>, safe_home: Vec<i32>, period: Duration) -> Self {
        Self {
            bus,
            safe_home,
            min_write_gap: period,
            last_write: None,
        }
    }
}

impl Node for FollowerNode {
    fn name(&self) -> &str {
        "arm-follower"
    }

    fn subscriptions(&self) -> Vec<String> {
        vec![topic::ACTION_COMMAND.to_string()]
    }

    fn on_start(&mut self) -> Result<(), NodeError> {
        self.bus.open()?;
        if !self.safe_home.is_empty() {
            self.bus.write_positions(&self.safe_home)?;
            tracing::info!(
                target: "telecap_proof",
                event = "follower_homed",
                "follower commanded to safe home pose"
            );
        }
        Ok(())
    }

    fn on_tick(&mut self) -> Result<Vec<Output>, NodeError> {
        let mdeg = read_positions_retry(self.bus.as_mut(), POSITION_READ_ATTEMPTS)?;
        let radians: Vec<f32> = mdeg
            .iter()
            .map(|&v| millidegrees_to_radians(v) as f32)
            .collect();
        Ok(vec![Output::new(
            topic::JOINT_FOLLOWER,
            Payload::Vector {
                name: "follower".to_string(),
                values: radians,
            },
        )])
    }

    fn on_input(&mut self, topic: &str, payload: &Payload) -> Result<Vec<Output>, NodeError> {
        if topic != topic::ACTION_COMMAND {
            return Ok(Vec::new());
        }
        let Payload::Vector { values, .. } = payload else {
            return Ok(Vec::new());
        };

        // Do not push commands faster than the bus period.
        let now = Instant::now();
        if let Some(last) = self.last_write {
            if now.duration_since(last) < self.min_write_gap {
                return Ok(Vec::new());
            }
        }
        self.last_write = Some(now);

        let targets: Vec<i32> = values.iter().map(|&v| v.round() as i32).collect();
        self.bus.write_positions(&targets)?;
        Ok(Vec::new())
    }

    fn on_stop(&mut self) {
        self.bus.close();
    }
}
