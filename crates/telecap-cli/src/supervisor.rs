//! Graph lifecycle: spawn one process per node, gate on socket readiness,
//! and tear everything down without SIGKILL unless forced.
//!
//! SIGKILL bypasses the adapters' signal handlers, which release cameras
//! and serial ports; skipping release makes device indices drift on the
//! next run. The shutdown therefore escalates in stages.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use telecap_core::config::DeviceConfig;
use telecap_wire::client::SocketPaths;

pub const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(5);
const STOP_RELEASE_WAIT: Duration = Duration::from_secs(3);
const TERM_WAIT: Duration = Duration::from_secs(2);
const KILL_GRACE: Duration = Duration::from_secs(5);
const STRAY_KILL_WAIT: Duration = Duration::from_secs(3);

/// Graph roles in startup order; the bridge must be up before any node
/// dials it, and the follower comes last so commands cannot arrive before
/// its safe-home move.
const GRAPH_ROLES: [&str; 6] = [
    "bridge",
    "camera-top",
    "camera-wrist",
    "arm-leader",
    "teleop",
    "arm-follower",
];

struct NodeProcess {
    role: &'static str,
    child: Child,
}

pub struct GraphSupervisor {
    node_binary: PathBuf,
    paths: SocketPaths,
    settle_delay: Duration,
    children: Vec<NodeProcess>,
}

impl GraphSupervisor {
    pub fn new(runtime_dir: &Path, settle_delay: Duration) -> Result<Self> {
        let node_binary = std::env::current_exe()
            .context("cannot locate current executable")?
            .parent()
            .map(|dir| dir.join("telecap-node"))
            .context("executable has no parent directory")?;
        Ok(Self {
            node_binary,
            paths: SocketPaths::new(runtime_dir),
            settle_delay,
            children: Vec::new(),
        })
    }

    pub fn socket_paths(&self) -> SocketPaths {
        self.paths.clone()
    }

    /// Removes stale socket files and kills lingering node processes from a
    /// crashed previous session, graceful first.
    pub async fn clean_stale(&self) -> Result<()> {
        for path in self.paths.all() {
            if path.exists() {
                warn!(path = %path.display(), "removing stale socket file");
                std::fs::remove_file(&path)?;
            }
        }

        let matched = Command::new("pkill")
            .args(["-TERM", "-f", "telecap-node"])
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false);
        if matched {
            warn!("lingering node processes found, terminating");
            tokio::time::sleep(STRAY_KILL_WAIT).await;
            let _ = Command::new("pkill")
                .args(["-KILL", "-f", "telecap-node"])
                .status()
                .await;
        }
        Ok(())
    }

    /// Spawns the dataflow graph in the background. Device identifiers are
    /// exported into each node's environment.
    pub async fn start_graph(&mut self, device: &DeviceConfig) -> Result<()> {
        for role in GRAPH_ROLES {
            let mut cmd = Command::new(&self.node_binary);
            cmd.arg("--role")
                .arg(role)
                .env("TELECAP_RUNTIME_DIR", &self.paths.runtime_dir)
                .env("ARM_LEADER_PORT", &device.leader_port)
                .env("ARM_FOLLOWER_PORT", &device.follower_port)
                .env("REPO_ID", &device.repo_id)
                .env("SINGLE_TASK", &device.single_task)
                .kill_on_drop(true);
            for cam in &device.cameras {
                let var = format!("CAMERA_{}_PATH", cam.name.0.to_ascii_uppercase());
                cmd.env(var, &cam.device_path);
            }

            let child = cmd
                .spawn()
                .with_context(|| format!("spawning node {role}"))?;
            info!(
                target: "telecap_proof",
                event = "node_spawned",
                role,
                pid = child.id().unwrap_or_default(),
                "node process spawned"
            );
            self.children.push(NodeProcess { role, child });

            // Give the bridge a head start; every other node dials it.
            if role == "bridge" {
                self.wait_for_path(&self.paths.hub(), SOCKET_WAIT_TIMEOUT)
                    .await?;
            }
        }
        Ok(())
    }

    /// Both CLI sockets must exist before the record loop starts.
    pub async fn wait_for_cli_sockets(&self) -> Result<()> {
        self.wait_for_path(&self.paths.frames(), SOCKET_WAIT_TIMEOUT)
            .await?;
        self.wait_for_path(&self.paths.joints(), SOCKET_WAIT_TIMEOUT)
            .await?;
        info!("bridge sockets ready");
        Ok(())
    }

    async fn wait_for_path(&self, path: &Path, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        while started.elapsed() < timeout {
            if path.exists() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        bail!(
            "socket {} did not appear within {}s",
            path.display(),
            timeout.as_secs()
        );
    }

    /// Adapters need a moment after spawn to finish device detection.
    pub async fn settle(&self) {
        info!(
            settle_s = self.settle_delay.as_secs(),
            "waiting for adapters to settle"
        );
        tokio::time::sleep(self.settle_delay).await;
    }

    /// Multi-phase shutdown: stop the bridge first (it broadcasts STOP so
    /// nodes drain and release devices), then terminate node processes,
    /// SIGKILL only after the grace window, then clean the sockets.
    pub async fn shutdown(&mut self) {
        info!("stopping dataflow graph");

        if let Some(bridge) = self.children.iter().find(|c| c.role == "bridge") {
            signal_term(&bridge.child).await;
        }
        tokio::time::sleep(STOP_RELEASE_WAIT).await;

        for node in &self.children {
            if node.role != "bridge" {
                signal_term(&node.child).await;
            }
        }
        tokio::time::sleep(TERM_WAIT).await;

        for node in &mut self.children {
            match tokio::time::timeout(KILL_GRACE, node.child.wait()).await {
                Ok(Ok(status)) => {
                    info!(role = node.role, status = %status, "node exited");
                }
                Ok(Err(err)) => warn!(role = node.role, error = %err, "node wait failed"),
                Err(_) => {
                    warn!(role = node.role, "node ignored SIGTERM, killing");
                    let _ = node.child.start_kill();
                    let _ = node.child.wait().await;
                }
            }
        }
        self.children.clear();

        for path in self.paths.all() {
            let _ = std::fs::remove_file(path);
        }
        info!("dataflow graph stopped");
    }
}

async fn signal_term(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let _ = Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .status()
        .await;
}

/// Arm serial devices must be operator-writable before the graph starts; a
/// wrong mode fails fast with the fix command instead of a cryptic open
/// error inside a node process.
pub fn check_device_permissions(ports: &[&str]) -> Result<(), String> {
    for port in ports {
        let path = Path::new(port);
        if !path.exists() {
            // Simulated cells have no device files.
            warn!(port, "device file not present, skipping permission check");
            continue;
        }
        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(err) => return Err(format!("cannot stat {port}: {err}")),
        };
        let mode = metadata.permissions().mode();
        if mode & 0o006 != 0o006 {
            return Err(format!(
                "device {port} is not operator-writable (mode {:o}); run: sudo chmod 666 {port}",
                mode & 0o777
            ));
        }
    }
    Ok(())
}
