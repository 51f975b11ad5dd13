#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use telecap_core::config::DeviceConfig;
use telecap_core::types::CameraName;
use telecap_node::adapter::{SimCamera, SimMotorBus};
use telecap_node::arm::{FollowerNode, LeaderNode};
use telecap_node::camera::CameraNode;
use telecap_node::hub;
use telecap_node::runtime::{run_node, Node, RunnerConfig};
use telecap_node::teleop::TeleopNode;
use telecap_wire::client::SocketPaths;

/// One dataflow node per process. The lifecycle supervisor spawns one of
/// these per graph role and tears them down with SIGTERM (SIGKILL only as a
/// last resort, because it would skip device release).
#[derive(Debug, Parser)]
#[command(name = "telecap-node")]
struct Args {
    /// bridge | camera-top | camera-wrist | arm-leader | arm-follower | teleop
    #[arg(long, env = "TELECAP_NODE_ROLE")]
    role: String,

    #[arg(long, env = "TELECAP_RUNTIME_DIR", default_value = "/tmp/telecap")]
    runtime_dir: PathBuf,

    /// Bus timer period in milliseconds (~30 Hz default).
    #[arg(long, env = "TELECAP_PERIOD_MS", default_value_t = 33)]
    period_ms: u64,

    #[arg(long, env = "ARM_LEADER_PORT", default_value = "/dev/ttyUSB0")]
    leader_port: String,

    #[arg(long, env = "ARM_FOLLOWER_PORT", default_value = "can0")]
    follower_port: String,

    #[arg(long, env = "CAMERA_TOP_PATH", default_value = "/dev/video0")]
    camera_top_path: String,

    #[arg(long, env = "CAMERA_WRIST_PATH", default_value = "/dev/video2")]
    camera_wrist_path: String,

    #[arg(long, env = "TELECAP_CAMERA_WIDTH", default_value_t = 640)]
    camera_width: u32,

    #[arg(long, env = "TELECAP_CAMERA_HEIGHT", default_value_t = 480)]
    camera_height: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    telecap_observe::logging::init_tracing();
    let args = Args::parse();

    let paths = SocketPaths::new(&args.runtime_dir);
    let cancel = CancellationToken::new();
    spawn_signal_task(cancel.clone());

    info!(role = %args.role, runtime_dir = %args.runtime_dir.display(), "node starting");

    if args.role == "bridge" {
        hub::run_hub(paths, cancel).await?;
        return Ok(());
    }

    let runner = RunnerConfig {
        hub_socket: paths.hub(),
        period: Duration::from_millis(args.period_ms),
        ..RunnerConfig::default()
    };

    let node = build_node(&args)?;
    run_node(node, runner, cancel).await?;
    Ok(())
}

fn build_node(args: &Args) -> Result<Box<dyn Node>> {
    // Real drivers (Zhonglin/Feetech serial leaders, the Piper CAN follower,
    // OpenCV/RealSense cameras) plug in behind the adapter traits; the
    // simulated variants keep the graph runnable without hardware attached.
    let device = DeviceConfig::resolve(None)?;
    let node: Box<dyn Node> = match args.role.as_str() {
        "camera-top" => Box::new(CameraNode::new(
            CameraName("top".to_string()),
            Box::new(SimCamera::new(
                args.camera_top_path.clone(),
                args.camera_width,
                args.camera_height,
            )),
        )),
        "camera-wrist" => Box::new(CameraNode::new(
            CameraName("wrist".to_string()),
            Box::new(SimCamera::new(
                args.camera_wrist_path.clone(),
                args.camera_width,
                args.camera_height,
            )),
        )),
        "arm-leader" => Box::new(LeaderNode::new(
            Box::new(SimMotorBus::new(
                args.leader_port.clone(),
                device.leader_joints.len(),
            )),
            device.leader_joints.clone(),
        )),
        "arm-follower" => Box::new(FollowerNode::new(
            Box::new(SimMotorBus::new(
                args.follower_port.clone(),
                device.leader_joints.len(),
            )),
            // Closest reachable pose to zero, measured on the cell.
            vec![5370, -2113, 3941, 3046, 18644, 24400],
            Duration::from_millis(args.period_ms),
        )),
        "teleop" => {
            let signs: Vec<i8> = device
                .leader_joints
                .iter()
                .map(|j| j.direction_sign)
                .collect();
            Box::new(TeleopNode::new(&signs))
        }
        other => bail!("unknown node role {other:?}"),
    };
    Ok(node)
}

fn spawn_signal_task(cancel: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(err) => {
                warn!(error = %err, "failed to install SIGINT handler");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = sigint.recv() => info!(signal = "SIGINT", "signal received"),
            _ = sigterm.recv() => info!(signal = "SIGTERM", "signal received"),
        }
        cancel.cancel();
    });
}
