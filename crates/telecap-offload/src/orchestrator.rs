//! The five-mode offload session.
//!
//! ```text
//! Idle → Probing → Uploading → Notifying → PollingStatus
//!                                         ↘ TrainingTriggered → Downloading → Done
//!                                         ↘ Failed
//! ```
//!
//! Local modes (0 and 4) end at `Done` without touching the network. The
//! mode is fixed per session.

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use telecap_core::config::OffloadMode;

use crate::api::{StatusResponse, TrainingService};
use crate::download::{self, CloudSsh};
use crate::edge::EdgeUploader;
use crate::poll::{poll_until_complete, ModelReadyProbe, PollConfig};
use crate::OffloadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffloadPhase {
    Idle,
    Probing,
    Uploading,
    Notifying,
    PollingStatus,
    TrainingTriggered,
    Downloading,
    Done,
    Failed,
}

impl OffloadPhase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Probing => "probing",
            Self::Uploading => "uploading",
            Self::Notifying => "notifying",
            Self::PollingStatus => "polling_status",
            Self::TrainingTriggered => "training_triggered",
            Self::Downloading => "downloading",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Independent resume points for re-running a failed hand-off.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResumeOptions {
    /// Remote already has the data; start at the training trigger.
    pub skip_upload: bool,
    /// Training already completed; start at the SFTP download.
    pub download_only: bool,
    /// Tar-based transfer (default). Disabled falls back to the
    /// incremental rsync mirror.
    pub use_tar: bool,
}

impl ResumeOptions {
    pub fn fresh() -> Self {
        Self {
            skip_upload: false,
            download_only: false,
            use_tar: true,
        }
    }
}

/// Secondary completion probe: the model directory on the edge server.
struct EdgeModelProbe<'a> {
    edge: &'a EdgeUploader,
    model_dir: String,
}

#[async_trait]
impl ModelReadyProbe for EdgeModelProbe<'_> {
    async fn model_ready(&self) -> Result<bool, OffloadError> {
        self.edge.remote_dir_exists(&self.model_dir).await
    }
}

pub struct Orchestrator<S: TrainingService> {
    mode: OffloadMode,
    edge: EdgeUploader,
    service: S,
    poll_cfg: PollConfig,
}

impl<S: TrainingService> Orchestrator<S> {
    pub fn new(mode: OffloadMode, edge: EdgeUploader, service: S, poll_cfg: PollConfig) -> Self {
        Self {
            mode,
            edge,
            service,
            poll_cfg,
        }
    }

    fn set_phase(&self, phase: OffloadPhase) {
        info!(
            target: "telecap_proof",
            event = "offload_phase",
            mode = %self.mode,
            phase = phase.as_str(),
            "offload phase"
        );
    }

    /// Startup connection probe for the offload modes; local modes skip it.
    pub async fn probe(&self) -> Result<(), OffloadError> {
        if !self.mode.uses_network() {
            return Ok(());
        }
        self.set_phase(OffloadPhase::Probing);
        if self.mode == OffloadMode::Edge {
            self.edge.test_connection(true).await?;
        }
        self.service.test_connection(true).await
    }

    /// Runs the post-recording hand-off to completion. Returns the terminal
    /// phase; the caller maps errors to exit codes (data stays intact on
    /// every failure path).
    pub async fn run(
        &self,
        dataset_root: &Path,
        repo_id: &str,
        model_output: &Path,
        resume: ResumeOptions,
        cancel: &CancellationToken,
    ) -> Result<OffloadPhase, OffloadError> {
        self.set_phase(OffloadPhase::Idle);
        if !self.mode.uses_network() {
            info!(mode = %self.mode, dataset = %dataset_root.display(), "local mode, nothing to offload");
            self.set_phase(OffloadPhase::Done);
            return Ok(OffloadPhase::Done);
        }

        let result = self
            .run_network(dataset_root, repo_id, model_output, resume, cancel)
            .await;
        match &result {
            Ok(phase) => self.set_phase(*phase),
            Err(err) => {
                warn!(error = %err, dataset = %dataset_root.display(), "offload failed; local data preserved");
                self.set_phase(OffloadPhase::Failed);
            }
        }
        result
    }

    async fn run_network(
        &self,
        dataset_root: &Path,
        repo_id: &str,
        model_output: &Path,
        resume: ResumeOptions,
        cancel: &CancellationToken,
    ) -> Result<OffloadPhase, OffloadError> {
        let response = if resume.download_only {
            // Training finished earlier; only the SSH coordinates are
            // missing locally.
            self.service.get_status(repo_id).await?
        } else {
            if !resume.skip_upload {
                self.set_phase(OffloadPhase::Uploading);
                if cancel.is_cancelled() {
                    return Err(OffloadError::Cancelled);
                }
                let tar_path = self
                    .edge
                    .sync_dataset(dataset_root, repo_id, resume.use_tar)
                    .await?;

                self.set_phase(OffloadPhase::Notifying);
                self.service
                    .notify_upload_complete(repo_id, tar_path.as_deref())
                    .await?;
            }

            self.set_phase(OffloadPhase::TrainingTriggered);
            match self.service.trigger_training(repo_id).await {
                Ok(Some(id)) => info!(repo_id, transaction_id = %id, "training triggered"),
                Ok(None) => info!(repo_id, "training triggered (no transaction id yet)"),
                // The poll loop re-triggers on READY; a failed first
                // trigger is not terminal.
                Err(err) => warn!(repo_id, error = %err, "initial training trigger failed"),
            }

            self.set_phase(OffloadPhase::PollingStatus);
            let probe = EdgeModelProbe {
                edge: &self.edge,
                model_dir: format!("{}/model", self.edge.remote_dataset_path(repo_id)),
            };
            let outcome = poll_until_complete(
                &self.service,
                repo_id,
                &self.poll_cfg,
                Some(&probe),
                cancel,
            )
            .await?;

            if outcome.via_probe && outcome.response.ssh_host.is_none() {
                // The flag lagged to the very end; fetch the final status
                // once for the SSH coordinates.
                self.service.get_status(repo_id).await?
            } else {
                outcome.response
            }
        };

        self.set_phase(OffloadPhase::Downloading);
        self.download(&response, model_output).await?;
        Ok(OffloadPhase::Done)
    }

    async fn download(
        &self,
        response: &StatusResponse,
        model_output: &Path,
    ) -> Result<(), OffloadError> {
        let ssh = CloudSsh::from_status(response)?;
        download::download_model(&ssh, model_output).await?;
        // The cloud trains on its own accelerator; local inference runs on
        // cuda.
        if let Err(err) = download::rewrite_model_device(model_output, "cuda") {
            warn!(error = %err, "model config rewrite failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telecap_core::config::EdgeConfig;

    struct PanickyService;

    #[async_trait]
    impl TrainingService for PanickyService {
        async fn notify_upload_complete(
            &self,
            _repo_id: &str,
            _tar_path: Option<&str>,
        ) -> Result<(), OffloadError> {
            panic!("local modes must not touch the service");
        }

        async fn trigger_training(&self, _repo_id: &str) -> Result<Option<String>, OffloadError> {
            panic!("local modes must not touch the service");
        }

        async fn get_status(&self, _repo_id: &str) -> Result<StatusResponse, OffloadError> {
            panic!("local modes must not touch the service");
        }
    }

    fn edge() -> EdgeUploader {
        EdgeUploader::new(
            EdgeConfig {
                host: "unreachable.invalid".to_string(),
                user: "u".to_string(),
                password: String::new(),
                port: 22,
                remote_path: "/uploaded_data".to_string(),
                ssh_key: None,
            },
            "tester",
        )
    }

    #[tokio::test]
    async fn local_modes_complete_without_network() -> anyhow::Result<()> {
        for mode in [OffloadMode::LocalOnly, OffloadMode::LocalRaw] {
            let orchestrator =
                Orchestrator::new(mode, edge(), PanickyService, PollConfig::default());
            orchestrator.probe().await?;
            let phase = orchestrator
                .run(
                    Path::new("/tmp/nonexistent-dataset"),
                    "repo",
                    Path::new("/tmp/nonexistent-model"),
                    ResumeOptions::fresh(),
                    &CancellationToken::new(),
                )
                .await?;
            assert_eq!(phase, OffloadPhase::Done);
        }
        Ok(())
    }

    #[tokio::test]
    async fn download_only_fails_cleanly_without_ssh_info() {
        struct NoSshService;

        #[async_trait]
        impl TrainingService for NoSshService {
            async fn notify_upload_complete(
                &self,
                _repo_id: &str,
                _tar_path: Option<&str>,
            ) -> Result<(), OffloadError> {
                Ok(())
            }
            async fn trigger_training(
                &self,
                _repo_id: &str,
            ) -> Result<Option<String>, OffloadError> {
                Ok(None)
            }
            async fn get_status(&self, _repo_id: &str) -> Result<StatusResponse, OffloadError> {
                Ok(StatusResponse {
                    status: "COMPLETED".to_string(),
                    ..Default::default()
                })
            }
        }

        let orchestrator = Orchestrator::new(
            OffloadMode::Edge,
            edge(),
            NoSshService,
            PollConfig::default(),
        );
        let err = orchestrator
            .run(
                Path::new("/tmp/nonexistent-dataset"),
                "repo",
                Path::new("/tmp/nonexistent-model"),
                ResumeOptions {
                    download_only: true,
                    ..ResumeOptions::fresh()
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OffloadError::DownloadFailed(_)));
    }
}
