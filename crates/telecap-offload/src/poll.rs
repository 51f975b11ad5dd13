//! Training-transaction polling.
//!
//! The service's status flag is known to lag; once training has been
//! triggered, an SSH `test -d` probe against the cloud model directory is
//! the ground truth and can complete the transaction even when the flag
//! never reaches `COMPLETED`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{OffloadTransaction, StatusResponse, TrainingService, TransactionStatus};
use crate::OffloadError;

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    /// Session-wide deadline; `TrainingTimeout` past it.
    pub session_deadline: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            session_deadline: Duration::from_secs(120 * 60),
        }
    }
}

/// Secondary completion detection.
#[async_trait]
pub trait ModelReadyProbe: Send + Sync {
    async fn model_ready(&self) -> Result<bool, OffloadError>;
}

#[derive(Debug)]
pub struct PollOutcome {
    pub response: StatusResponse,
    pub transaction: OffloadTransaction,
    /// True when the filesystem probe, not the status flag, concluded the
    /// transaction.
    pub via_probe: bool,
}

/// Polls `GET /status/{repo_id}` every `interval` until a terminal state.
///
/// A `READY` observed before training was triggered in this polling session
/// causes exactly one `POST /train/{repo_id}`; repeated `READY` readings
/// never re-trigger.
pub async fn poll_until_complete<S>(
    service: &S,
    repo_id: &str,
    cfg: &PollConfig,
    probe: Option<&dyn ModelReadyProbe>,
    cancel: &CancellationToken,
) -> Result<PollOutcome, OffloadError>
where
    S: TrainingService + ?Sized,
{
    let started = Instant::now();
    let mut transaction = OffloadTransaction::new(repo_id);
    let mut training_triggered = false;
    let mut last_response = StatusResponse::default();

    loop {
        if started.elapsed() > cfg.session_deadline {
            return Err(OffloadError::TrainingTimeout(cfg.session_deadline));
        }
        if cancel.is_cancelled() {
            return Err(OffloadError::Cancelled);
        }

        match service.get_status(repo_id).await {
            Ok(response) => {
                transaction.observe(&response);
                let status = response.parsed_status();
                info!(
                    repo_id,
                    status = %response.status,
                    transaction_id = transaction.transaction_id.as_deref().unwrap_or(""),
                    progress_pct = response.progress_pct.unwrap_or(0.0),
                    "training status"
                );
                last_response = response;

                match status {
                    TransactionStatus::Completed => {
                        return Ok(PollOutcome {
                            response: last_response,
                            transaction,
                            via_probe: false,
                        });
                    }
                    TransactionStatus::Failed => {
                        return Err(OffloadError::TrainingFailed {
                            status: last_response.status.clone(),
                            detail: transaction
                                .transaction_id
                                .clone()
                                .unwrap_or_else(|| "no transaction id".to_string()),
                        });
                    }
                    TransactionStatus::Ready if !training_triggered => {
                        info!(repo_id, "encoding complete, triggering training");
                        match service.trigger_training(repo_id).await {
                            Ok(id) => {
                                if transaction.transaction_id.is_none() {
                                    transaction.transaction_id = id;
                                }
                            }
                            Err(err) => {
                                warn!(repo_id, error = %err, "training trigger failed");
                            }
                        }
                        // One POST per polling session, success or not.
                        training_triggered = true;
                    }
                    TransactionStatus::Training => {
                        training_triggered = true;
                    }
                    _ => {}
                }
            }
            Err(err) => {
                // A blip must not kill a two-hour poll.
                warn!(repo_id, error = %err, "status poll failed");
            }
        }

        if training_triggered {
            if let Some(probe) = probe {
                match probe.model_ready().await {
                    Ok(true) => {
                        info!(
                            repo_id,
                            "model directory present; treating transaction as completed"
                        );
                        transaction.status = TransactionStatus::Completed;
                        return Ok(PollOutcome {
                            response: last_response,
                            transaction,
                            via_probe: true,
                        });
                    }
                    Ok(false) => {}
                    Err(err) => warn!(repo_id, error = %err, "model probe failed"),
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(OffloadError::Cancelled),
            _ = tokio::time::sleep(cfg.interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    struct ScriptedService {
        statuses: Mutex<Vec<&'static str>>,
        trigger_calls: AtomicU32,
    }

    impl ScriptedService {
        fn new(mut script: Vec<&'static str>) -> Self {
            script.reverse();
            Self {
                statuses: Mutex::new(script),
                trigger_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl TrainingService for ScriptedService {
        async fn notify_upload_complete(
            &self,
            _repo_id: &str,
            _tar_path: Option<&str>,
        ) -> Result<(), OffloadError> {
            Ok(())
        }

        async fn trigger_training(&self, _repo_id: &str) -> Result<Option<String>, OffloadError> {
            self.trigger_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some("tx-test".to_string()))
        }

        async fn get_status(&self, _repo_id: &str) -> Result<StatusResponse, OffloadError> {
            let mut guard = self.statuses.lock().unwrap();
            let status = guard.pop().unwrap_or("COMPLETED");
            Ok(StatusResponse {
                status: status.to_string(),
                ..Default::default()
            })
        }
    }

    fn fast_cfg() -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(5),
            session_deadline: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn ready_triggers_training_exactly_once() -> anyhow::Result<()> {
        let service = ScriptedService::new(vec![
            "UPLOADING",
            "ENCODING",
            "READY",
            "READY",
            "TRAINING",
            "COMPLETED",
        ]);
        let cancel = CancellationToken::new();
        let outcome =
            poll_until_complete(&service, "repo", &fast_cfg(), None, &cancel).await?;
        assert_eq!(outcome.transaction.status, TransactionStatus::Completed);
        assert!(!outcome.via_probe);
        assert_eq!(service.trigger_calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn failed_status_surfaces_training_failure() {
        let service = ScriptedService::new(vec!["TRAINING", "TRAINING_FAILED"]);
        let cancel = CancellationToken::new();
        let err = poll_until_complete(&service, "repo", &fast_cfg(), None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OffloadError::TrainingFailed { .. }));
    }

    struct FlippingProbe {
        ready: AtomicBool,
    }

    #[async_trait]
    impl ModelReadyProbe for FlippingProbe {
        async fn model_ready(&self) -> Result<bool, OffloadError> {
            Ok(self.ready.swap(true, Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn lagging_status_completes_via_filesystem_probe() -> anyhow::Result<()> {
        // The flag never says COMPLETED; the probe flips true on its second
        // check.
        let service = ScriptedService::new(vec![
            "TRAINING", "TRAINING", "TRAINING", "TRAINING", "TRAINING", "TRAINING",
        ]);
        let probe = FlippingProbe {
            ready: AtomicBool::new(false),
        };
        let cancel = CancellationToken::new();
        let outcome =
            poll_until_complete(&service, "repo", &fast_cfg(), Some(&probe), &cancel).await?;
        assert!(outcome.via_probe);
        assert_eq!(outcome.transaction.status, TransactionStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn session_deadline_yields_training_timeout() {
        let service = ScriptedService::new(vec![
            "TRAINING", "TRAINING", "TRAINING", "TRAINING", "TRAINING", "TRAINING",
            "TRAINING", "TRAINING", "TRAINING", "TRAINING", "TRAINING", "TRAINING",
        ]);
        let cfg = PollConfig {
            interval: Duration::from_millis(5),
            session_deadline: Duration::from_millis(30),
        };
        let cancel = CancellationToken::new();
        let err = poll_until_complete(&service, "repo", &cfg, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OffloadError::TrainingTimeout(_)));
    }
}
