//! Asynchronous episode saver.
//!
//! A fixed worker pool consumes save tasks from a bounded FIFO. The caller
//! hands over ownership of the swapped-out buffer; each attempt works from
//! a fresh copy so retries never see a half-drained buffer.
//! `save_episode` runs at most once per attempt and exactly once on
//! success. Failed episodes are recorded and later episodes continue; the
//! dataset's completeness is judged per episode, never by file counts.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use telecap_core::types::CameraName;
use telecap_observe::metrics::Counter;

use crate::buffer::{EpisodeBuffer, Features};
use crate::columnar;
use crate::encoder::VideoEncoder;
use crate::image_writer::ImageWriterPool;
use crate::layout::DatasetLayout;
use crate::meta::{episode_stats, DatasetMetadata, EpisodeRecord};
use crate::DatasetError;

#[derive(Debug, Clone)]
pub struct EpisodeSaveTask {
    pub buffer: EpisodeBuffer,
    pub features: Features,
    pub skip_encoding: bool,
}

#[derive(Debug, Clone)]
pub struct SaverConfig {
    pub queue_size: usize,
    pub workers: usize,
    /// Attempts per episode, exponential backoff between them.
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub stop_poll_interval: Duration,
    /// Floor of the dynamic image-flush timeout.
    pub image_flush_floor: Duration,
    /// Per queued image share of the dynamic timeout.
    pub per_image_flush: Duration,
}

impl Default for SaverConfig {
    fn default() -> Self {
        Self {
            queue_size: 8,
            workers: 1,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            stop_poll_interval: Duration::from_millis(500),
            image_flush_floor: Duration::from_secs(120),
            per_image_flush: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Default)]
pub struct SaverStats {
    pub total_queued: Counter,
    pub total_completed: Counter,
    pub total_failed: Counter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaverStatus {
    pub queue_size: usize,
    pub pending: Vec<u64>,
    pub failed_episodes: Vec<u64>,
    pub total_queued: u64,
    pub total_completed: u64,
    pub total_failed: u64,
}

struct SaverShared {
    layout: DatasetLayout,
    images: Arc<ImageWriterPool>,
    encoder: Arc<dyn VideoEncoder>,
    meta: Mutex<DatasetMetadata>,
    /// Episode indices queued or in flight.
    pending: Mutex<HashSet<u64>>,
    queued: AtomicUsize,
    failed: Mutex<Vec<u64>>,
    stats: SaverStats,
    /// Escalated cancellation: remaining queued tasks are abandoned.
    hard_cancel: CancellationToken,
    cfg: SaverConfig,
}

impl SaverShared {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashSet<u64>> {
        match self.pending.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn lock_failed(&self) -> std::sync::MutexGuard<'_, Vec<u64>> {
        match self.failed.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn record_failure(&self, episode: u64) {
        self.lock_pending().remove(&episode);
        self.lock_failed().push(episode);
        self.stats.total_failed.inc();
    }

    fn record_success(&self, episode: u64) {
        self.lock_pending().remove(&episode);
        self.stats.total_completed.inc();
    }
}

pub struct AsyncEpisodeSaver {
    tx: Option<mpsc::Sender<EpisodeSaveTask>>,
    shared: Arc<SaverShared>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl AsyncEpisodeSaver {
    pub fn new(
        layout: DatasetLayout,
        meta: DatasetMetadata,
        images: Arc<ImageWriterPool>,
        encoder: Arc<dyn VideoEncoder>,
        cfg: SaverConfig,
    ) -> Self {
        Self::with_hard_cancel(layout, meta, images, encoder, cfg, CancellationToken::new())
    }

    /// `hard_cancel` is the escalated cancellation signal: when it fires,
    /// queued tasks are abandoned at the next task boundary.
    pub fn with_hard_cancel(
        layout: DatasetLayout,
        meta: DatasetMetadata,
        images: Arc<ImageWriterPool>,
        encoder: Arc<dyn VideoEncoder>,
        cfg: SaverConfig,
        hard_cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<EpisodeSaveTask>(cfg.queue_size.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let shared = Arc::new(SaverShared {
            layout,
            images,
            encoder,
            meta: Mutex::new(meta),
            pending: Mutex::new(HashSet::new()),
            queued: AtomicUsize::new(0),
            failed: Mutex::new(Vec::new()),
            stats: SaverStats::default(),
            hard_cancel,
            cfg: cfg.clone(),
        });

        let workers = (0..cfg.workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let shared = shared.clone();
                tokio::spawn(worker_loop(worker, rx, shared))
            })
            .collect();

        Self {
            tx: Some(tx),
            shared,
            workers,
        }
    }

    /// Hands one deep-copied buffer to the pool. The bounded queue blocks an
    /// operator-initiated save when full. Returns the queue depth after
    /// enqueue.
    pub async fn queue_save(&self, task: EpisodeSaveTask) -> Result<usize, DatasetError> {
        let episode = task.buffer.episode_index;
        let Some(tx) = self.tx.as_ref() else {
            return Err(DatasetError::SaverClosed);
        };
        self.shared.lock_pending().insert(episode);
        self.shared.stats.total_queued.inc();
        let depth = self.shared.queued.fetch_add(1, Ordering::SeqCst) + 1;
        if tx.send(task).await.is_err() {
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);
            self.shared.lock_pending().remove(&episode);
            return Err(DatasetError::SaverClosed);
        }
        info!(
            target: "telecap_proof",
            event = "save_queued",
            episode_index = episode,
            queue_depth = depth,
            "episode queued for async save"
        );
        Ok(depth)
    }

    pub fn status(&self) -> SaverStatus {
        let mut pending: Vec<u64> = self.shared.lock_pending().iter().copied().collect();
        pending.sort_unstable();
        SaverStatus {
            queue_size: self.shared.queued.load(Ordering::SeqCst),
            pending,
            failed_episodes: self.shared.lock_failed().clone(),
            total_queued: self.shared.stats.total_queued.get(),
            total_completed: self.shared.stats.total_completed.get(),
            total_failed: self.shared.stats.total_failed.get(),
        }
    }

    /// Escalated cancellation: workers abandon queued tasks at the next task
    /// boundary. In-flight saves still run to completion.
    pub fn hard_cancel(&self) {
        self.shared.hard_cancel.cancel();
    }

    /// Blocks until the queue is empty and no task is in flight, polling the
    /// pending set. A blind queue join is not enough because the mpsc
    /// receiver gives no completion signal for the task being processed.
    pub async fn stop(mut self, wait_for_completion: bool) -> SaverStatus {
        if wait_for_completion {
            loop {
                let empty = self.shared.lock_pending().is_empty();
                if empty {
                    break;
                }
                tokio::time::sleep(self.shared.cfg.stop_poll_interval).await;
            }
        }
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.await;
        }
        let status = self.status();
        info!(
            total_queued = status.total_queued,
            total_completed = status.total_completed,
            total_failed = status.total_failed,
            "episode saver stopped"
        );
        status
    }
}

async fn worker_loop(
    worker: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<EpisodeSaveTask>>>,
    shared: Arc<SaverShared>,
) {
    loop {
        let task = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(task) = task else {
            return;
        };
        shared.queued.fetch_sub(1, Ordering::SeqCst);
        let episode = task.buffer.episode_index;

        if shared.hard_cancel.is_cancelled() {
            warn!(
                worker,
                episode_index = episode,
                "cancellation escalated; abandoning queued save"
            );
            shared.record_failure(episode);
            continue;
        }

        save_with_retries(worker, &shared, &task).await;
    }
}

async fn save_with_retries(worker: usize, shared: &Arc<SaverShared>, task: &EpisodeSaveTask) {
    let episode = task.buffer.episode_index;
    let max_attempts = shared.cfg.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        // Every attempt starts from an untouched copy; extraction below is
        // destructive.
        let copy = task.buffer.clone();
        match save_episode(shared, copy, task).await {
            Ok(frames) => {
                shared.record_success(episode);
                info!(
                    target: "telecap_proof",
                    event = "save_completed",
                    episode_index = episode,
                    frames,
                    attempt,
                    "episode saved"
                );
                return;
            }
            Err(err) if attempt < max_attempts && err.is_retryable() => {
                let backoff = shared.cfg.retry_backoff * 2u32.saturating_pow(attempt - 1);
                warn!(
                    worker,
                    episode_index = episode,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "save attempt failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(err) => {
                error!(
                    worker,
                    episode_index = episode,
                    attempt,
                    error = %err,
                    "episode save failed"
                );
                shared.record_failure(episode);
                return;
            }
        }
    }
}

/// One attempt. Returns the frame count on success.
async fn save_episode(
    shared: &Arc<SaverShared>,
    buffer: EpisodeBuffer,
    task: &EpisodeSaveTask,
) -> Result<usize, DatasetError> {
    let episode = buffer.episode_index;
    let frames = buffer.size();
    let cameras: Vec<CameraName> = buffer.image_paths.keys().cloned().collect();
    let fps = buffer.fps;

    // Wait for this episode's images to reach disk. The timeout scales with
    // the amount of queued work.
    let flush_budget = shared
        .cfg
        .per_image_flush
        .saturating_mul((frames * cameras.len().max(1)) as u32);
    let timeout = shared.cfg.image_flush_floor.max(flush_budget);
    let report = shared.images.wait_for_episode(episode, timeout).await?;
    if report.failed > 0 {
        return Err(DatasetError::ImagesMissing {
            episode,
            failed: report.failed,
        });
    }

    buffer.check()?;
    let record = EpisodeRecord {
        episode_index: episode,
        length: frames as u64,
        task: buffer.task.clone(),
        stats: episode_stats(&buffer),
    };

    let data_path = shared.layout.data_file(episode);
    {
        let data_path = data_path.clone();
        tokio::task::spawn_blocking(move || columnar::write_episode(&data_path, &buffer))
            .await
            .map_err(join_err)??;
    }

    if !task.skip_encoding {
        for cam in &cameras {
            let encoder = shared.encoder.clone();
            let images_dir = shared.layout.image_dir(episode, cam);
            let video_path = shared.layout.video_file(episode, cam);
            tokio::task::spawn_blocking(move || {
                encoder.encode_frames(&images_dir, &video_path, fps)
            })
            .await
            .map_err(join_err)??;
        }
    }

    {
        let shared = shared.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || {
            let mut meta = match shared.meta.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            meta.append_episode(&record)
        })
        .await
        .map_err(join_err)??;
    }

    // Only the files this episode was supposed to produce must exist.
    // Global counts are never asserted: async saves can leave gaps.
    if !data_path.exists() {
        return Err(DatasetError::FileMissing {
            episode,
            path: data_path,
        });
    }
    for cam in &cameras {
        if !task.skip_encoding {
            let video = shared.layout.video_file(episode, cam);
            if !video.exists() {
                return Err(DatasetError::FileMissing {
                    episode,
                    path: video,
                });
            }
        }
        for frame in 0..frames as u64 {
            let png = shared.layout.image_file(episode, cam, frame);
            if !png.exists() {
                return Err(DatasetError::FileMissing { episode, path: png });
            }
        }
    }

    Ok(frames)
}

fn join_err(err: tokio::task::JoinError) -> DatasetError {
    DatasetError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        err.to_string(),
    ))
}
