#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod types;

pub mod topic {
    use crate::types::CameraName;

    pub const JOINT_LEADER: &str = "joint/leader";
    pub const JOINT_FOLLOWER: &str = "joint/follower";
    pub const ACTION_COMMAND: &str = "action/command";

    pub const IMAGE_PREFIX: &str = "image/";

    pub fn image(cam: &CameraName) -> String {
        format!("{IMAGE_PREFIX}{}", cam.0)
    }
}
