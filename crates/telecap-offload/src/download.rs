//! Model retrieval.
//!
//! The trained model is a directory of many small files on the cloud
//! instance, fetched over SFTP directly (not via the edge server). The
//! status response carries the cloud SSH coordinates with a base64-encoded
//! password.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use base64::Engine;
use tokio::process::Command;
use tracing::{info, warn};

use crate::api::StatusResponse;
use crate::OffloadError;

pub const DOWNLOAD_DEADLINE: Duration = Duration::from_secs(1800);

#[derive(Debug, Clone)]
pub struct CloudSsh {
    pub host: String,
    pub user: String,
    pub password: String,
    pub port: u16,
    pub model_path: String,
}

impl CloudSsh {
    /// Extracts the download coordinates from a `COMPLETED` status.
    pub fn from_status(response: &StatusResponse) -> Result<Self, OffloadError> {
        let host = response
            .ssh_host
            .clone()
            .ok_or_else(|| OffloadError::DownloadFailed("status missing ssh_host".to_string()))?;
        let user = response.ssh_username.clone().ok_or_else(|| {
            OffloadError::DownloadFailed("status missing ssh_username".to_string())
        })?;
        let password_b64 = response.ssh_password_b64.clone().ok_or_else(|| {
            OffloadError::DownloadFailed("status missing ssh_password_b64".to_string())
        })?;
        let model_path = response
            .model_path
            .clone()
            .ok_or_else(|| OffloadError::DownloadFailed("status missing model_path".to_string()))?;

        let password_bytes = base64::engine::general_purpose::STANDARD
            .decode(password_b64.trim())
            .map_err(|e| OffloadError::DownloadFailed(format!("bad ssh password: {e}")))?;
        let password = String::from_utf8(password_bytes)
            .map_err(|e| OffloadError::DownloadFailed(format!("bad ssh password: {e}")))?;

        Ok(Self {
            host,
            user,
            password,
            port: response.ssh_port.unwrap_or(22),
            model_path,
        })
    }
}

/// Recursively downloads `model_path` into `local_output` over SFTP.
pub async fn download_model(ssh: &CloudSsh, local_output: &Path) -> Result<(), OffloadError> {
    std::fs::create_dir_all(local_output)?;
    info!(
        host = %ssh.host,
        port = ssh.port,
        remote = %ssh.model_path,
        local = %local_output.display(),
        "downloading model from cloud"
    );

    // Trailing `/.` copies the directory's contents, not the directory.
    let source = format!(
        "{}@{}:{}/.",
        ssh.user,
        ssh.host,
        ssh.model_path.trim_end_matches('/')
    );
    let mut argv: Vec<String> = Vec::new();
    if !ssh.password.is_empty() {
        argv.extend(["sshpass".to_string(), "-p".to_string(), ssh.password.clone()]);
    }
    argv.extend([
        "scp".to_string(),
        "-r".to_string(),
        "-P".to_string(),
        ssh.port.to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        source,
        local_output.display().to_string(),
    ]);

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let child = cmd.spawn()?;
    let output = tokio::time::timeout(DOWNLOAD_DEADLINE, child.wait_with_output())
        .await
        .map_err(|_| {
            OffloadError::DownloadFailed(format!(
                "download exceeded {}s deadline",
                DOWNLOAD_DEADLINE.as_secs()
            ))
        })??;

    if !output.status.success() {
        return Err(OffloadError::DownloadFailed(
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }

    info!(local = %local_output.display(), "model download completed");
    Ok(())
}

/// Rewrites the downloaded model's `config.json` device field for local
/// inference (the cloud trains on `npu`). Returns false when the file or
/// field is absent; that is a warning, not a failure.
pub fn rewrite_model_device(model_dir: &Path, to_device: &str) -> Result<bool, OffloadError> {
    let config_path = model_dir.join("config.json");
    if !config_path.exists() {
        warn!(path = %config_path.display(), "model config.json not found");
        return Ok(false);
    }

    let text = std::fs::read_to_string(&config_path)?;
    let mut value: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| OffloadError::DownloadFailed(format!("config.json parse: {e}")))?;
    let Some(device) = value.get_mut("device") else {
        warn!(path = %config_path.display(), "config.json has no device field");
        return Ok(false);
    };

    let previous = device.as_str().unwrap_or("unknown").to_string();
    *device = serde_json::Value::String(to_device.to_string());
    let bytes = serde_json::to_vec_pretty(&value)
        .map_err(|e| OffloadError::DownloadFailed(format!("config.json serialize: {e}")))?;
    std::fs::write(&config_path, bytes)?;
    info!(from = %previous, to = to_device, "model device field updated");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed_status() -> StatusResponse {
        StatusResponse {
            status: "COMPLETED".to_string(),
            transaction_id: Some("tx".to_string()),
            progress_pct: Some(100.0),
            ssh_host: Some("10.1.2.3".to_string()),
            ssh_username: Some("train".to_string()),
            ssh_port: Some(2202),
            ssh_password_b64: Some("c2VjcmV0".to_string()),
            model_path: Some("/models/repo/final".to_string()),
        }
    }

    #[test]
    fn cloud_ssh_decodes_base64_password() -> anyhow::Result<()> {
        let ssh = CloudSsh::from_status(&completed_status())?;
        assert_eq!(ssh.password, "secret");
        assert_eq!(ssh.port, 2202);
        assert_eq!(ssh.model_path, "/models/repo/final");
        Ok(())
    }

    #[test]
    fn missing_ssh_fields_fail_with_a_named_field() {
        let mut status = completed_status();
        status.ssh_password_b64 = None;
        let err = CloudSsh::from_status(&status).unwrap_err();
        assert!(err.to_string().contains("ssh_password_b64"));
    }

    fn temp_model_dir(test_name: &str) -> std::path::PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!(
            "telecap-model-{}-{}-{}",
            test_name,
            std::process::id(),
            telecap_observe::time::unix_time_ms()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn device_field_is_rewritten_in_place() -> anyhow::Result<()> {
        let dir = temp_model_dir("rewrite");
        std::fs::write(
            dir.join("config.json"),
            r#"{"device": "npu", "hidden_dim": 512}"#,
        )?;
        assert!(rewrite_model_device(&dir, "cuda")?);

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("config.json"))?)?;
        assert_eq!(value["device"], "cuda");
        assert_eq!(value["hidden_dim"], 512);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn absent_config_or_field_is_tolerated() -> anyhow::Result<()> {
        let dir = temp_model_dir("absent");
        assert!(!rewrite_model_device(&dir, "cuda")?);
        std::fs::write(dir.join("config.json"), r#"{"hidden_dim": 512}"#)?;
        assert!(!rewrite_model_device(&dir, "cuda")?);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }
}
