//! Training-service HTTP client.
//!
//! The service is consumed through a trait so the polling logic can be
//! exercised against scripted fakes; the HTTP implementation carries the
//! real request shapes.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use telecap_core::config::ApiConfig;
use telecap_observe::time::unix_time_ms;

use crate::OffloadError;

pub const HTTP_CALL_DEADLINE: Duration = Duration::from_secs(30);
pub const QUICK_PROBE_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Uploading,
    Encoding,
    Ready,
    Training,
    Completed,
    Failed,
    Unknown,
}

impl TransactionStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "UPLOADING" => Self::Uploading,
            "ENCODING" => Self::Encoding,
            "READY" => Self::Ready,
            "TRAINING" => Self::Training,
            "COMPLETED" => Self::Completed,
            "FAILED" | "ERROR" | "UPLOAD_FAILED" | "ENCODING_FAILED" | "TRAINING_FAILED" => {
                Self::Failed
            }
            _ => Self::Unknown,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// `GET /status/{repo_id}` response. SSH fields appear once the status is
/// `COMPLETED` and carry the cloud credentials for the SFTP model download.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub status: String,
    pub transaction_id: Option<String>,
    pub progress_pct: Option<f32>,
    pub ssh_host: Option<String>,
    pub ssh_username: Option<String>,
    pub ssh_port: Option<u16>,
    pub ssh_password_b64: Option<String>,
    pub model_path: Option<String>,
}

impl StatusResponse {
    pub fn parsed_status(&self) -> TransactionStatus {
        TransactionStatus::parse(&self.status)
    }
}

/// One training job as tracked locally. Created on the upload-complete
/// notification; the id is issued by the service.
#[derive(Debug, Clone)]
pub struct OffloadTransaction {
    pub repo_id: String,
    pub transaction_id: Option<String>,
    pub status: TransactionStatus,
    pub last_updated_ms: u64,
}

impl OffloadTransaction {
    pub fn new(repo_id: impl Into<String>) -> Self {
        Self {
            repo_id: repo_id.into(),
            transaction_id: None,
            status: TransactionStatus::Uploading,
            last_updated_ms: unix_time_ms(),
        }
    }

    pub fn observe(&mut self, response: &StatusResponse) {
        self.status = response.parsed_status();
        if self.transaction_id.is_none() {
            self.transaction_id = response.transaction_id.clone();
        }
        self.last_updated_ms = unix_time_ms();
    }
}

#[derive(Debug, Serialize)]
struct NotifyRequest<'a> {
    repo_id: &'a str,
    api_username: &'a str,
    api_password: &'a str,
    tar: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tar_path: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct TrainResponse {
    transaction_id: Option<String>,
}

#[async_trait]
pub trait TrainingService: Send + Sync {
    /// Startup reachability check with a firm deadline.
    async fn test_connection(&self, _quick: bool) -> Result<(), OffloadError> {
        Ok(())
    }

    /// `POST /notify-upload-complete`.
    async fn notify_upload_complete(
        &self,
        repo_id: &str,
        tar_path: Option<&str>,
    ) -> Result<(), OffloadError>;

    /// `POST /train/{repo_id}`; returns the transaction id when issued.
    async fn trigger_training(&self, repo_id: &str) -> Result<Option<String>, OffloadError>;

    /// `GET /status/{repo_id}`.
    async fn get_status(&self, repo_id: &str) -> Result<StatusResponse, OffloadError>;
}

pub struct HttpTrainingService {
    client: reqwest::Client,
    cfg: ApiConfig,
}

impl HttpTrainingService {
    pub fn new(cfg: ApiConfig) -> Result<Self, OffloadError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_CALL_DEADLINE)
            .build()?;
        Ok(Self { client, cfg })
    }
}

#[async_trait]
impl TrainingService for HttpTrainingService {
    /// A slow failure would delay operator feedback, so the quick deadline
    /// is firm.
    async fn test_connection(&self, quick: bool) -> Result<(), OffloadError> {
        let deadline = if quick {
            QUICK_PROBE_DEADLINE
        } else {
            HTTP_CALL_DEADLINE
        };
        let url = format!("{}/status/__probe", self.cfg.base_url);
        let request = self.client.get(&url).timeout(deadline).send();
        match tokio::time::timeout(deadline, request).await {
            // Any HTTP response proves the service is reachable.
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(OffloadError::ConnectionProbeFailed(err.to_string())),
            Err(_) => Err(OffloadError::ConnectionProbeFailed(format!(
                "no response within {}s",
                deadline.as_secs()
            ))),
        }
    }

    async fn notify_upload_complete(
        &self,
        repo_id: &str,
        tar_path: Option<&str>,
    ) -> Result<(), OffloadError> {
        let url = format!("{}/notify-upload-complete", self.cfg.base_url);
        let body = NotifyRequest {
            repo_id,
            api_username: &self.cfg.username,
            api_password: &self.cfg.password,
            tar: tar_path.is_some(),
            tar_path,
        };
        let response = self.client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(OffloadError::Api(format!(
                "notify-upload-complete returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn trigger_training(&self, repo_id: &str) -> Result<Option<String>, OffloadError> {
        let url = format!("{}/train/{}", self.cfg.base_url, repo_id);
        let response = self.client.post(&url).send().await?;
        if !response.status().is_success() {
            return Err(OffloadError::Api(format!(
                "train returned {}",
                response.status()
            )));
        }
        let parsed: TrainResponse = response.json().await.unwrap_or(TrainResponse {
            transaction_id: None,
        });
        Ok(parsed.transaction_id)
    }

    async fn get_status(&self, repo_id: &str) -> Result<StatusResponse, OffloadError> {
        let url = format!("{}/status/{}", self.cfg.base_url, repo_id);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(OffloadError::Api(format!(
                "status returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parsing_covers_service_spellings() {
        assert_eq!(TransactionStatus::parse("READY"), TransactionStatus::Ready);
        assert_eq!(
            TransactionStatus::parse("completed"),
            TransactionStatus::Completed
        );
        for failed in ["FAILED", "ERROR", "UPLOAD_FAILED", "ENCODING_FAILED", "TRAINING_FAILED"] {
            assert_eq!(TransactionStatus::parse(failed), TransactionStatus::Failed);
        }
        assert_eq!(
            TransactionStatus::parse("SOMETHING_NEW"),
            TransactionStatus::Unknown
        );
    }

    #[test]
    fn terminal_states_are_completed_and_failed() {
        assert!(TransactionStatus::Completed.is_terminal());
        assert!(TransactionStatus::Failed.is_terminal());
        assert!(!TransactionStatus::Ready.is_terminal());
        assert!(!TransactionStatus::Training.is_terminal());
    }

    #[test]
    fn transaction_latches_first_transaction_id() {
        let mut tx = OffloadTransaction::new("repo");
        let mut resp = StatusResponse {
            status: "TRAINING".to_string(),
            transaction_id: Some("tx-1".to_string()),
            ..Default::default()
        };
        tx.observe(&resp);
        assert_eq!(tx.transaction_id.as_deref(), Some("tx-1"));
        assert_eq!(tx.status, TransactionStatus::Training);

        resp.transaction_id = Some("tx-2".to_string());
        tx.observe(&resp);
        assert_eq!(tx.transaction_id.as_deref(), Some("tx-1"));
    }

    #[test]
    fn status_response_deserializes_ssh_fields() -> anyhow::Result<()> {
        let json = r#"{
            "status": "COMPLETED",
            "transaction_id": "tx-9",
            "progress_pct": 100.0,
            "ssh_host": "10.0.0.9",
            "ssh_username": "train",
            "ssh_port": 2222,
            "ssh_password_b64": "c2VjcmV0",
            "model_path": "/models/repo/final"
        }"#;
        let resp: StatusResponse = serde_json::from_str(json)?;
        assert_eq!(resp.parsed_status(), TransactionStatus::Completed);
        assert_eq!(resp.ssh_port, Some(2222));
        assert_eq!(resp.model_path.as_deref(), Some("/models/repo/final"));
        Ok(())
    }
}
