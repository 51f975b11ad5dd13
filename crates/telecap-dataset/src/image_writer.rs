//! Background PNG writers.
//!
//! The queue is unbounded: back-pressure here would stall the record loop
//! and temporally misalign frames. Memory is governed by the record loop's
//! auto-stop guard instead. Write errors drop the frame and acknowledge the
//! task so the queue can drain; the async saver discovers the hole during
//! its flush wait and fails that episode cleanly.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use tokio::sync::mpsc;
use tracing::{error, info};

use telecap_core::types::ImageFrame;
use telecap_observe::metrics::{timed, Counter, DurationAgg, Gauge};

use crate::DatasetError;

#[derive(Debug)]
pub struct ImageTask {
    pub episode_index: u64,
    pub image: ImageFrame,
    pub path: PathBuf,
}

#[derive(Debug, Default, Clone, Copy)]
struct EpisodeProgress {
    pending: u64,
    failed: u64,
}

#[derive(Debug, Default)]
struct FlushState {
    episodes: Mutex<HashMap<u64, EpisodeProgress>>,
}

impl FlushState {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, EpisodeProgress>> {
        match self.episodes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn enqueued(&self, episode: u64) {
        self.lock().entry(episode).or_default().pending += 1;
    }

    fn finished(&self, episode: u64, ok: bool) {
        let mut guard = self.lock();
        let entry = guard.entry(episode).or_default();
        entry.pending = entry.pending.saturating_sub(1);
        if !ok {
            entry.failed += 1;
        }
    }

    fn snapshot(&self, episode: u64) -> EpisodeProgress {
        self.lock().get(&episode).copied().unwrap_or_default()
    }

    fn forget(&self, episode: u64) {
        self.lock().remove(&episode);
    }
}

#[derive(Debug, Default)]
pub struct ImageWriterMetrics {
    pub enqueued_total: Counter,
    pub written_total: Counter,
    pub failed_total: Counter,
    pub queue_depth: Gauge,
    pub write_duration: DurationAgg,
}

/// Flush outcome for one episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub failed: u64,
}

pub struct ImageWriterPool {
    tx: Option<mpsc::UnboundedSender<ImageTask>>,
    state: Arc<FlushState>,
    metrics: Arc<ImageWriterMetrics>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl ImageWriterPool {
    pub fn new(workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<ImageTask>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let state = Arc::new(FlushState::default());
        let metrics = Arc::new(ImageWriterMetrics::default());

        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let state = state.clone();
                let metrics = metrics.clone();
                tokio::spawn(worker_loop(worker, rx, state, metrics))
            })
            .collect();

        Self {
            tx: Some(tx),
            state,
            metrics,
            workers: handles,
        }
    }

    pub fn metrics(&self) -> Arc<ImageWriterMetrics> {
        self.metrics.clone()
    }

    /// Queues one frame. Never blocks the record loop.
    pub fn enqueue(&self, task: ImageTask) -> Result<(), DatasetError> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(DatasetError::SaverClosed);
        };
        self.state.enqueued(task.episode_index);
        self.metrics.enqueued_total.inc();
        self.metrics.queue_depth.add(1);
        tx.send(task).map_err(|_| DatasetError::SaverClosed)
    }

    /// Waits until every queued frame of `episode` has been acknowledged.
    /// Returns how many of them failed.
    pub async fn wait_for_episode(
        &self,
        episode: u64,
        timeout: Duration,
    ) -> Result<FlushReport, DatasetError> {
        let started = Instant::now();
        loop {
            let progress = self.state.snapshot(episode);
            if progress.pending == 0 {
                self.state.forget(episode);
                return Ok(FlushReport {
                    failed: progress.failed,
                });
            }
            if started.elapsed() > timeout {
                return Err(DatasetError::ImageFlushTimeout {
                    episode,
                    waited_s: started.elapsed().as_secs(),
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Closes the queue and drains the workers. The pool never observes
    /// cancellation: the queue is finite once the record loop stops
    /// enqueuing.
    pub async fn shutdown(mut self) {
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.await;
        }
        info!(
            enqueued = self.metrics.enqueued_total.get(),
            written = self.metrics.written_total.get(),
            failed = self.metrics.failed_total.get(),
            "image writer drained"
        );
    }
}

async fn worker_loop(
    worker: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ImageTask>>>,
    state: Arc<FlushState>,
    metrics: Arc<ImageWriterMetrics>,
) {
    loop {
        let task = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(task) = task else {
            return;
        };

        let episode = task.episode_index;
        let result = {
            let metrics = metrics.clone();
            tokio::task::spawn_blocking(move || timed(&metrics.write_duration, || write_png(&task)))
                .await
        };
        metrics.queue_depth.sub(1);
        match result {
            Ok(Ok(())) => {
                metrics.written_total.inc();
                state.finished(episode, true);
            }
            Ok(Err(err)) => {
                metrics.failed_total.inc();
                error!(
                    worker,
                    episode_index = episode,
                    error = %err,
                    "png write failed; frame dropped"
                );
                state.finished(episode, false);
            }
            Err(join_err) => {
                metrics.failed_total.inc();
                error!(worker, episode_index = episode, error = %join_err, "png worker panicked");
                state.finished(episode, false);
            }
        }
    }
}

fn write_png(task: &ImageTask) -> Result<(), DatasetError> {
    if let Some(parent) = task.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(&task.path)?;
    let mut writer = BufWriter::new(file);
    PngEncoder::new(&mut writer)
        .write_image(
            &task.image.rgb,
            task.image.width,
            task.image.height,
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| DatasetError::Validation(format!("png encode: {e}")))?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(test_name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!(
            "telecap-imgwriter-{}-{}-{}",
            test_name,
            std::process::id(),
            telecap_observe::time::unix_time_ms()
        ));
        dir
    }

    fn frame() -> ImageFrame {
        ImageFrame::new(4, 3, vec![128u8; 36]).unwrap()
    }

    #[tokio::test]
    async fn writes_frames_and_reports_clean_flush() -> anyhow::Result<()> {
        let dir = temp_dir("clean");
        let pool = ImageWriterPool::new(2);
        for i in 0..10u64 {
            pool.enqueue(ImageTask {
                episode_index: 0,
                image: frame(),
                path: dir.join(format!("frame_{i:06}.png")),
            })?;
        }
        let report = pool.wait_for_episode(0, Duration::from_secs(30)).await?;
        assert_eq!(report.failed, 0);
        for i in 0..10u64 {
            assert!(dir.join(format!("frame_{i:06}.png")).exists());
        }
        pool.shutdown().await;
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[tokio::test]
    async fn failed_write_is_acknowledged_and_counted() -> anyhow::Result<()> {
        let pool = ImageWriterPool::new(1);
        // A path under a file (not a directory) cannot be created.
        let bad_root = temp_dir("bad");
        std::fs::create_dir_all(&bad_root)?;
        std::fs::write(bad_root.join("blocker"), b"x")?;
        pool.enqueue(ImageTask {
            episode_index: 3,
            image: frame(),
            path: bad_root.join("blocker").join("frame_000000.png"),
        })?;
        let report = pool.wait_for_episode(3, Duration::from_secs(30)).await?;
        assert_eq!(report.failed, 1);
        pool.shutdown().await;
        std::fs::remove_dir_all(bad_root)?;
        Ok(())
    }

    #[tokio::test]
    async fn flush_wait_is_immediate_for_an_episode_with_no_frames() {
        let pool = ImageWriterPool::new(1);
        let report = pool
            .wait_for_episode(9, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(report.failed, 0);
        pool.shutdown().await;
    }
}
