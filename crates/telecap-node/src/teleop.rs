//! Teleop mapper and safety monitor.
//!
//! The leader and follower are calibrated independently; their physical zero
//! poses need not match. The mapping therefore captures only relative
//! motion: a `(leader, follower)` pose pair latched at the first leader
//! sample becomes the origin, and every later leader delta is scaled into
//! follower units around it. Direction signs are applied to the raw leader
//! reading before the delta so the baseline itself stays in the follower's
//! reference frame.

use std::time::Duration;

use tracing::{error, info, warn};

use telecap_core::topic;
use telecap_core::types::{radians_to_millidegrees, MILLIDEG_PER_RAD};
use telecap_observe::rate::RateLimiter;
use telecap_wire::Payload;

use crate::runtime::{Node, Output};
use crate::NodeError;

/// 30 degrees in milli-degrees.
pub const WARNING_THRESHOLD_MDEG: i32 = 30_000;
/// 60 degrees in milli-degrees.
pub const EMERGENCY_THRESHOLD_MDEG: i32 = 60_000;

const WARNING_LOG_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapperState {
    /// No follower reading yet; leader samples are ignored.
    AwaitingFollower,
    /// Both baselines latched; commands flow.
    BaselineEstablished,
    /// Terminal. Cleared only by a process restart.
    Emergency,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MapperEvent {
    /// Nothing to emit (baseline pending, or suppressed after emergency).
    Silent,
    /// Follower targets in milli-degrees.
    Command(Vec<i32>),
    /// Deviation crossed the emergency threshold; commands stop for good.
    Emergency {
        joint: usize,
        target_mdeg: i32,
        actual_mdeg: i32,
        deviation_mdeg: i32,
    },
}

pub struct TeleopMapper {
    signs: Vec<f32>,
    warning_mdeg: i32,
    emergency_mdeg: i32,
    state: MapperState,
    follower_baseline: Option<Vec<i32>>,
    leader_baseline: Option<Vec<f32>>,
    follower_actual: Option<Vec<i32>>,
    warn_limiter: RateLimiter,
}

impl TeleopMapper {
    pub fn new(signs: &[i8]) -> Self {
        Self::with_thresholds(signs, WARNING_THRESHOLD_MDEG, EMERGENCY_THRESHOLD_MDEG)
    }

    pub fn with_thresholds(signs: &[i8], warning_mdeg: i32, emergency_mdeg: i32) -> Self {
        Self {
            signs: signs.iter().map(|&s| f32::from(s)).collect(),
            warning_mdeg,
            emergency_mdeg,
            state: MapperState::AwaitingFollower,
            follower_baseline: None,
            leader_baseline: None,
            follower_actual: None,
            warn_limiter: RateLimiter::new(WARNING_LOG_WINDOW),
        }
    }

    pub fn state(&self) -> MapperState {
        self.state
    }

    /// Latest follower reading in radians. The first one becomes the
    /// follower baseline.
    pub fn on_follower(&mut self, radians: &[f32]) {
        let mdeg: Vec<i32> = radians
            .iter()
            .map(|&v| radians_to_millidegrees(f64::from(v)))
            .collect();
        if self.follower_baseline.is_none() {
            info!(
                target: "telecap_proof",
                event = "follower_baseline",
                baseline_mdeg = ?mdeg,
                "follower baseline captured"
            );
            self.follower_baseline = Some(mdeg.clone());
        }
        self.follower_actual = Some(mdeg);
    }

    /// One leader sample in radians. Returns the command to emit, if any.
    pub fn on_leader(&mut self, radians: &[f32]) -> MapperEvent {
        if self.state == MapperState::Emergency {
            return MapperEvent::Silent;
        }
        let Some(follower_baseline) = self.follower_baseline.clone() else {
            // Expected once per session while the follower warms up.
            return MapperEvent::Silent;
        };

        let signed: Vec<f32> = radians
            .iter()
            .enumerate()
            .map(|(i, &v)| v * self.signs.get(i).copied().unwrap_or(1.0))
            .collect();

        let Some(leader_baseline) = self.leader_baseline.clone() else {
            self.leader_baseline = Some(signed);
            self.state = MapperState::BaselineEstablished;
            info!(
                target: "telecap_proof",
                event = "mapping_established",
                follower_baseline_mdeg = ?follower_baseline,
                "pose mapping baseline established"
            );
            return MapperEvent::Silent;
        };

        let joints = signed
            .len()
            .min(leader_baseline.len())
            .min(follower_baseline.len());
        let mut targets = Vec::with_capacity(joints);
        for i in 0..joints {
            let delta = f64::from(signed[i] - leader_baseline[i]);
            targets.push(follower_baseline[i] + (delta * MILLIDEG_PER_RAD).round() as i32);
        }

        let actual = self
            .follower_actual
            .clone()
            .unwrap_or(follower_baseline);
        let mut max_dev = 0i32;
        let mut max_joint = 0usize;
        for (i, &target) in targets.iter().enumerate() {
            let Some(&actual_i) = actual.get(i) else {
                continue;
            };
            let dev = (target - actual_i).abs();
            if dev > max_dev {
                max_dev = dev;
                max_joint = i;
            }
        }

        if max_dev > self.emergency_mdeg {
            self.state = MapperState::Emergency;
            let target_mdeg = targets[max_joint];
            let actual_mdeg = actual.get(max_joint).copied().unwrap_or(0);
            error!(
                target: "telecap_proof",
                event = "emergency_stop",
                joint = max_joint,
                target_mdeg = target_mdeg,
                actual_mdeg = actual_mdeg,
                deviation_mdeg = max_dev,
                threshold_mdeg = self.emergency_mdeg,
                "deviation exceeded the emergency threshold; commands suppressed until restart"
            );
            return MapperEvent::Emergency {
                joint: max_joint,
                target_mdeg,
                actual_mdeg,
                deviation_mdeg: max_dev,
            };
        }

        if max_dev > self.warning_mdeg {
            if let Some(suppressed) = self.warn_limiter.check() {
                warn!(
                    joint = max_joint,
                    deviation_mdeg = max_dev,
                    threshold_mdeg = self.warning_mdeg,
                    suppressed,
                    "large leader/follower deviation"
                );
            }
        }

        MapperEvent::Command(targets)
    }
}

/// Node wrapper: `joint/leader` + `joint/follower` in, `action/command` out.
pub struct TeleopNode {
    mapper: TeleopMapper,
}

impl TeleopNode {
    pub fn new(signs: &[i8]) -> Self {
        Self {
            mapper: TeleopMapper::new(signs),
        }
    }
}

impl Node for TeleopNode {
    fn name(&self) -> &str {
        "teleop"
    }

    fn subscriptions(&self) -> Vec<String> {
        vec![
            topic::JOINT_LEADER.to_string(),
            topic::JOINT_FOLLOWER.to_string(),
        ]
    }

    fn on_start(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    fn on_tick(&mut self) -> Result<Vec<Output>, NodeError> {
        Ok(Vec::new())
    }

    fn on_input(&mut self, topic_name: &str, payload: &Payload) -> Result<Vec<Output>, NodeError> {
        let Payload::Vector { values, .. } = payload else {
            return Ok(Vec::new());
        };
        match topic_name {
            topic::JOINT_FOLLOWER => {
                self.mapper.on_follower(values);
                Ok(Vec::new())
            }
            topic::JOINT_LEADER => match self.mapper.on_leader(values) {
                MapperEvent::Command(targets) => Ok(vec![Output::new(
                    topic::ACTION_COMMAND,
                    Payload::Vector {
                        name: "teleop".to_string(),
                        values: targets.iter().map(|&v| v as f32).collect(),
                    },
                )]),
                MapperEvent::Silent | MapperEvent::Emergency { .. } => Ok(Vec::new()),
            },
            _ => Ok(Vec::new()),
        }
    }

    fn on_stop(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rad(mdeg: f64) -> f32 {
        (mdeg / MILLIDEG_PER_RAD) as f32
    }

    #[test]
    fn leader_before_follower_is_silent() {
        let mut mapper = TeleopMapper::new(&[1, 1, 1]);
        assert_eq!(mapper.on_leader(&[0.1, 0.2, 0.3]), MapperEvent::Silent);
        assert_eq!(mapper.state(), MapperState::AwaitingFollower);
    }

    #[test]
    fn first_leader_sample_latches_baseline_and_emits_nothing() {
        let mut mapper = TeleopMapper::new(&[1, 1]);
        mapper.on_follower(&[rad(10_000.0), rad(20_000.0)]);
        assert_eq!(mapper.on_leader(&[0.5, 0.5]), MapperEvent::Silent);
        assert_eq!(mapper.state(), MapperState::BaselineEstablished);
    }

    #[test]
    fn targets_are_follower_baseline_plus_signed_delta() {
        let mut mapper = TeleopMapper::new(&[1, -1]);
        mapper.on_follower(&[rad(10_000.0), rad(20_000.0)]);
        let l1 = [0.1f32, 0.1];
        mapper.on_leader(&l1);

        // Keep the follower tracking so deviation stays small.
        mapper.on_follower(&[rad(10_000.0), rad(20_000.0)]);
        let delta = 5_000.0 / MILLIDEG_PER_RAD;
        let l2 = [0.1 + delta as f32, 0.1 + delta as f32];
        match mapper.on_leader(&l2) {
            MapperEvent::Command(targets) => {
                assert_eq!(targets.len(), 2);
                assert!((targets[0] - 15_000).abs() <= 1, "targets[0]={}", targets[0]);
                // Negative sign mirrors joint 1.
                assert!((targets[1] - 15_000).abs() <= 1, "targets[1]={}", targets[1]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn emergency_is_terminal_and_logged_once() {
        let mut mapper = TeleopMapper::new(&[1, 1, 1, 1]);
        mapper.on_follower(&[0.0; 4]);
        mapper.on_leader(&[0.0; 4]);

        // Leader jumps 80 degrees on joint 3 while the follower is frozen.
        let jump = rad(80_000.0);
        let event = mapper.on_leader(&[0.0, 0.0, 0.0, jump]);
        match event {
            MapperEvent::Emergency {
                joint,
                deviation_mdeg,
                ..
            } => {
                assert_eq!(joint, 3);
                assert!((deviation_mdeg - 80_000).abs() <= 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(mapper.state(), MapperState::Emergency);

        // Every later sample is suppressed, even benign ones.
        assert_eq!(mapper.on_leader(&[0.0; 4]), MapperEvent::Silent);
        assert_eq!(mapper.on_leader(&[0.0, 0.0, 0.0, jump]), MapperEvent::Silent);
    }

    #[test]
    fn warning_band_still_emits_commands() {
        let mut mapper = TeleopMapper::new(&[1]);
        mapper.on_follower(&[0.0]);
        mapper.on_leader(&[0.0]);
        // 40 degrees: above warning, below emergency.
        let event = mapper.on_leader(&[rad(40_000.0)]);
        match event {
            MapperEvent::Command(targets) => assert!((targets[0] - 40_000).abs() <= 2),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(mapper.state(), MapperState::BaselineEstablished);
    }

    #[test]
    fn node_routes_inputs_to_outputs() {
        let mut node = TeleopNode::new(&[1, 1]);
        let follower = Payload::Vector {
            name: "follower".to_string(),
            values: vec![0.0, 0.0],
        };
        let leader = Payload::Vector {
            name: "leader".to_string(),
            values: vec![0.0, 0.0],
        };
        assert!(node.on_input(topic::JOINT_FOLLOWER, &follower).unwrap().is_empty());
        // First leader sample only latches.
        assert!(node.on_input(topic::JOINT_LEADER, &leader).unwrap().is_empty());
        let outputs = node.on_input(topic::JOINT_LEADER, &leader).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].topic, "action/command");
    }
}
