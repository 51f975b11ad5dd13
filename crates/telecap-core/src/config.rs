use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CameraName, JointSpec, JointUnit};

pub const DEFAULT_FPS: u32 = 30;
pub const DEFAULT_MEMORY_LIMIT_GB: f64 = 19.0;
/// Record-loop ticks between RSS samples (~3 s at 30 fps).
pub const MEMORY_CHECK_INTERVAL_TICKS: u64 = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {path}: line {line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("unknown offload mode {0:?} (expected 0..=4)")]
    BadOffloadMode(String),
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Post-episode hand-off mode, fixed per session via `CLOUD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OffloadMode {
    /// Encode locally, nothing leaves the machine.
    LocalOnly,
    /// Skip encoding, upload raw frames to cloud.
    CloudRaw,
    /// Skip encoding, archive to the LAN edge server which encodes.
    Edge,
    /// Encode locally, upload encoded videos + columnar to cloud.
    CloudEncoded,
    /// Skip encoding, keep raw frames locally for later processing.
    LocalRaw,
}

impl OffloadMode {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim() {
            "0" => Ok(Self::LocalOnly),
            "1" => Ok(Self::CloudRaw),
            "2" => Ok(Self::Edge),
            "3" => Ok(Self::CloudEncoded),
            "4" => Ok(Self::LocalRaw),
            other => Err(ConfigError::BadOffloadMode(other.to_string())),
        }
    }

    /// Modes that ship raw frames skip local video encoding entirely.
    pub fn skip_local_encoding(self) -> bool {
        matches!(self, Self::CloudRaw | Self::Edge | Self::LocalRaw)
    }

    /// Modes that talk to a remote before/after recording.
    pub fn uses_network(self) -> bool {
        matches!(self, Self::CloudRaw | Self::Edge | Self::CloudEncoded)
    }
}

impl fmt::Display for OffloadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LocalOnly => "local-only",
            Self::CloudRaw => "cloud-raw",
            Self::Edge => "edge",
            Self::CloudEncoded => "cloud-encoded",
            Self::LocalRaw => "local-raw",
        };
        f.write_str(s)
    }
}

/// Where a resolved config field came from. Precedence: env > file > default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Env,
    File,
    Default,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Env => "env",
            Self::File => "file",
            Self::Default => "default",
        })
    }
}

/// Raw key=value device-config file. Inline `#` comments are tolerated and
/// values may be single- or double-quoted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
    pub entries: BTreeMap<String, String>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut entries = BTreeMap::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, rest)) = line.split_once('=') else {
                return Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    message: "expected key=value".to_string(),
                });
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    message: "empty key".to_string(),
                });
            }
            entries.insert(key.to_string(), unquote_value(rest));
        }
        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }
}

/// Strips an inline comment (outside quotes) and surrounding quotes.
fn unquote_value(raw: &str) -> String {
    let trimmed = raw.trim();
    let (quote, body) = match trimmed.as_bytes().first() {
        Some(b'"') => (Some('"'), &trimmed[1..]),
        Some(b'\'') => (Some('\''), &trimmed[1..]),
        _ => (None, trimmed),
    };
    match quote {
        Some(q) => match body.find(q) {
            Some(end) => body[..end].to_string(),
            None => body.trim().to_string(),
        },
        None => match body.find('#') {
            Some(end) => body[..end].trim().to_string(),
            None => body.to_string(),
        },
    }
}

/// Resolves one field with env > file > default precedence and logs the
/// winning source.
pub fn layered_field(
    name: &str,
    env_key: &str,
    file: Option<&ConfigFile>,
    default: &str,
) -> (String, ConfigSource) {
    if let Ok(v) = std::env::var(env_key) {
        if !v.trim().is_empty() {
            tracing::info!(field = name, source = %ConfigSource::Env, "config field resolved");
            return (v, ConfigSource::Env);
        }
    }
    if let Some(v) = file.and_then(|f| f.get(name)) {
        tracing::info!(field = name, source = %ConfigSource::File, "config field resolved");
        return (v.to_string(), ConfigSource::File);
    }
    tracing::info!(field = name, source = %ConfigSource::Default, "config field resolved");
    (default.to_string(), ConfigSource::Default)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub name: CameraName,
    pub device_path: String,
}

/// Everything the cell needs to run one capture session.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub repo_id: String,
    pub single_task: String,
    pub fps: u32,
    pub cameras: Vec<CameraConfig>,
    pub leader_port: String,
    pub follower_port: String,
    pub leader_joints: Vec<JointSpec>,
    pub offload: OffloadMode,
    pub hardware_encoder: bool,
    pub show_preview: bool,
    pub memory_limit_gb: f64,
}

impl DeviceConfig {
    /// Layered load: env > `file` > hard-coded defaults.
    pub fn resolve(file: Option<&ConfigFile>) -> Result<Self, ConfigError> {
        let (repo_id, _) = layered_field("repo_id", "REPO_ID", file, "default_repo");
        let (single_task, _) = layered_field("single_task", "SINGLE_TASK", file, "default_task");
        let (fps, _) = layered_field("fps", "TELECAP_FPS", file, "30");
        let fps: u32 = fps
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("fps {fps:?} is not an integer")))?;

        let (cloud, _) = layered_field("cloud", "CLOUD", file, "0");
        let offload = OffloadMode::parse(&cloud)?;

        let (npu, _) = layered_field("npu", "NPU", file, "0");
        let (show, _) = layered_field("show", "SHOW", file, "0");

        let (memory_limit_gb, _) = layered_field(
            "memory_limit_gb",
            "MEMORY_LIMIT_GB",
            file,
            &DEFAULT_MEMORY_LIMIT_GB.to_string(),
        );
        let memory_limit_gb: f64 = memory_limit_gb
            .trim()
            .parse()
            .unwrap_or(DEFAULT_MEMORY_LIMIT_GB);

        let (top, _) = layered_field("camera_top_path", "CAMERA_TOP_PATH", file, "/dev/video0");
        let (wrist, _) =
            layered_field("camera_wrist_path", "CAMERA_WRIST_PATH", file, "/dev/video2");
        let (leader_port, _) =
            layered_field("arm_leader_port", "ARM_LEADER_PORT", file, "/dev/ttyUSB0");
        let (follower_port, _) =
            layered_field("arm_follower_port", "ARM_FOLLOWER_PORT", file, "can0");

        let cfg = Self {
            repo_id,
            single_task,
            fps,
            cameras: vec![
                CameraConfig {
                    name: CameraName("top".to_string()),
                    device_path: top,
                },
                CameraConfig {
                    name: CameraName("wrist".to_string()),
                    device_path: wrist,
                },
            ],
            leader_port,
            follower_port,
            leader_joints: default_leader_joints(),
            offload,
            hardware_encoder: is_truthy(&npu),
            show_preview: is_truthy(&show),
            memory_limit_gb,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fps == 0 {
            return Err(ConfigError::Invalid("fps must be > 0".to_string()));
        }
        if self.repo_id.trim().is_empty() {
            return Err(ConfigError::Invalid("repo_id must be non-empty".to_string()));
        }
        if self.leader_joints.is_empty() {
            return Err(ConfigError::Invalid(
                "leader bus must declare at least one joint".to_string(),
            ));
        }
        for spec in &self.leader_joints {
            spec.validate()
                .map_err(|e| ConfigError::Invalid(format!("joint {}: {e}", spec.id)))?;
        }
        // All joints of one bus share one unit system; the leader bus is
        // declared in radians so the milli-degree conversion holds for every
        // joint including the gripper.
        let unit = self.leader_joints[0].unit;
        if self.leader_joints.iter().any(|j| j.unit != unit) {
            return Err(ConfigError::Invalid(
                "mixed joint units on the leader bus".to_string(),
            ));
        }
        if unit != JointUnit::Radians {
            return Err(ConfigError::Invalid(format!(
                "leader bus must be declared in radians (got {unit:?})"
            )));
        }
        Ok(())
    }

    pub fn camera_names(&self) -> Vec<CameraName> {
        self.cameras.iter().map(|c| c.name.clone()).collect()
    }
}

fn is_truthy(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn default_leader_joints() -> Vec<JointSpec> {
    // Six body joints plus gripper; signs mirror the shoulder pair and the
    // wrist roll between the leader and follower mechanics.
    let signs: [i8; 7] = [1, -1, -1, 1, -1, 1, 1];
    signs
        .iter()
        .enumerate()
        .map(|(id, &direction_sign)| JointSpec {
            id: id as u8,
            direction_sign,
            range_min: -180_000,
            range_max: 180_000,
            homing_offset: 0,
            unit: JointUnit::Radians,
        })
        .collect()
}

/// Edge-server transport settings (`EDGE_SERVER_*`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeConfig {
    pub host: String,
    pub user: String,
    pub password: String,
    pub port: u16,
    pub remote_path: String,
    pub ssh_key: Option<String>,
}

impl EdgeConfig {
    pub fn resolve(file: Option<&ConfigFile>) -> Self {
        let (host, _) = layered_field("edge_server_host", "EDGE_SERVER_HOST", file, "127.0.0.1");
        let (user, _) = layered_field("edge_server_user", "EDGE_SERVER_USER", file, "nupylot");
        let (password, _) = layered_field("edge_server_password", "EDGE_SERVER_PASSWORD", file, "");
        let (port, _) = layered_field("edge_server_port", "EDGE_SERVER_PORT", file, "22");
        let (remote_path, _) =
            layered_field("edge_server_path", "EDGE_SERVER_PATH", file, "/uploaded_data");
        let ssh_key = std::env::var("EDGE_SERVER_KEY").ok().filter(|v| !v.is_empty());
        Self {
            host,
            user,
            password,
            port: port.trim().parse().unwrap_or(22),
            remote_path,
            ssh_key,
        }
    }

    /// User-scoped upload root: `{remote_path}/{api_username}/{repo_id}`.
    pub fn upload_path(&self, api_username: &str, repo_id: &str) -> String {
        format!("{}/{}/{}", self.remote_path, api_username, repo_id)
    }
}

/// Training-service settings (`API_*`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

impl ApiConfig {
    pub fn resolve(file: Option<&ConfigFile>) -> Self {
        let (base_url, _) =
            layered_field("api_base_url", "API_BASE_URL", file, "http://127.0.0.1:8000");
        let (username, _) = layered_field("api_username", "API_USERNAME", file, "default");
        let (password, _) = layered_field("api_password", "API_PASSWORD", file, "");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            password,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_values_with_comments_and_quotes() -> anyhow::Result<()> {
        let text = r#"
# device block
arm_leader_port = /dev/ttyUSB0   # detected 2026-07-30
camera_top_path = "/dev/video0"
api_password = 'hunter#2'
"#;
        let file = ConfigFile::parse(text, Path::new("test.conf"))?;
        assert_eq!(file.get("arm_leader_port"), Some("/dev/ttyUSB0"));
        assert_eq!(file.get("camera_top_path"), Some("/dev/video0"));
        // '#' inside quotes is part of the value, not a comment.
        assert_eq!(file.get("api_password"), Some("hunter#2"));
        Ok(())
    }

    #[test]
    fn rejects_lines_without_equals() {
        let err = ConfigFile::parse("just-a-word\n", Path::new("bad.conf")).unwrap_err();
        match err {
            ConfigError::Parse { line, .. } => assert_eq!(line, 1),
            other => panic!("expected Parse, got {other:?}"),
        }
    }

    #[test]
    fn offload_mode_parse_and_flags() {
        assert_eq!(OffloadMode::parse("2").unwrap(), OffloadMode::Edge);
        assert!(OffloadMode::Edge.skip_local_encoding());
        assert!(OffloadMode::Edge.uses_network());
        assert!(!OffloadMode::LocalOnly.uses_network());
        assert!(!OffloadMode::CloudEncoded.skip_local_encoding());
        assert!(OffloadMode::parse("5").is_err());
    }

    #[test]
    fn mixed_units_on_one_bus_are_rejected() {
        let mut joints = default_leader_joints();
        joints[6].unit = JointUnit::Range0To100;
        let cfg = DeviceConfig {
            repo_id: "r".to_string(),
            single_task: "t".to_string(),
            fps: 30,
            cameras: Vec::new(),
            leader_port: "p".to_string(),
            follower_port: "c".to_string(),
            leader_joints: joints,
            offload: OffloadMode::LocalOnly,
            hardware_encoder: false,
            show_preview: false,
            memory_limit_gb: DEFAULT_MEMORY_LIMIT_GB,
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("mixed joint units"));
    }

    #[test]
    fn edge_upload_path_is_user_scoped() {
        let cfg = EdgeConfig {
            host: "edge".to_string(),
            user: "nupylot".to_string(),
            password: String::new(),
            port: 22,
            remote_path: "/uploaded_data".to_string(),
            ssh_key: None,
        };
        assert_eq!(
            cfg.upload_path("alice", "sort_blocks"),
            "/uploaded_data/alice/sort_blocks"
        );
    }
}
