//! The record loop.
//!
//! One iteration per bus tick: pull the latest observation and action over
//! the bridge, append to the episode buffer under the lock, never block on
//! saving. A tick that falls behind is skipped; lost ticks are acceptable,
//! temporally misaligned frames are not.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use telecap_core::config::DeviceConfig;
use telecap_core::topic;
use telecap_core::types::Frame;
use telecap_dataset::buffer::{EpisodeBuffer, Features, SharedEpisodeBuffer};
use telecap_dataset::image_writer::{ImageTask, ImageWriterPool};
use telecap_dataset::layout::DatasetLayout;
use telecap_dataset::saver::{AsyncEpisodeSaver, EpisodeSaveTask};
use telecap_wire::client::BridgeClient;

use crate::keys::{ControlKey, KeyListener};
use crate::memory::MemoryGuard;

pub const RESET_TIMEOUT: Duration = Duration::from_secs(60);

/// Why the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Operator,
    MemoryLimit,
    Interrupted,
}

#[derive(Debug)]
pub struct SessionSummary {
    pub episodes_queued: u64,
    pub frames_recorded: u64,
    pub end: SessionEnd,
}

pub struct RecordSession<'a> {
    pub device: &'a DeviceConfig,
    pub layout: DatasetLayout,
    pub features: Features,
    pub client: BridgeClient,
    pub buffer: SharedEpisodeBuffer,
    pub images: std::sync::Arc<ImageWriterPool>,
    pub saver: &'a AsyncEpisodeSaver,
    pub keys: KeyListener,
    pub guard: MemoryGuard,
    pub cancel: CancellationToken,
    pub countdown: Duration,
    pub reset_timeout: Duration,
}

enum LoopOutcome {
    SaveAndNext,
    Exit(SessionEnd),
}

impl RecordSession<'_> {
    /// Runs the full session: countdown, episode loops, reset states.
    /// Exit during reset takes the same path as exit from recording.
    pub async fn run(mut self) -> anyhow::Result<SessionSummary> {
        let mut episodes_queued = 0u64;
        let mut frames_recorded = 0u64;

        if !self.countdown.is_zero() {
            let secs = self.countdown.as_secs().max(1);
            for remaining in (1..=secs).rev() {
                operator_prompt(&format!("recording starts in {remaining}"));
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        operator_prompt("ready; press n to save and start the next episode");

        let end = loop {
            let episode = self.buffer.episode_index();
            info!(
                episode_index = episode,
                "recording; n=save+next p=proceed e=exit"
            );
            match self.record_episode().await? {
                LoopOutcome::Exit(end) => {
                    frames_recorded += self.queue_current_episode(&mut episodes_queued).await?;
                    break end;
                }
                LoopOutcome::SaveAndNext => {
                    frames_recorded += self.queue_current_episode(&mut episodes_queued).await?;
                    match self.reset_phase().await {
                        Some(end) => break end,
                        None => continue,
                    }
                }
            }
        };

        info!(
            target: "telecap_proof",
            event = "session_summary",
            episodes_queued,
            frames_recorded,
            "collection finished"
        );
        operator_prompt(&format!(
            "collection finished; {episodes_queued} episodes recorded"
        ));
        self.client.disconnect();
        Ok(SessionSummary {
            episodes_queued,
            frames_recorded,
            end,
        })
    }

    /// One episode: ticks until the operator saves or the session ends.
    async fn record_episode(&mut self) -> anyhow::Result<LoopOutcome> {
        let period = Duration::from_secs_f64(1.0 / f64::from(self.device.fps));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut ticks = 0u64;

        loop {
            interval.tick().await;
            ticks += 1;

            if self.cancel.is_cancelled() {
                return Ok(LoopOutcome::Exit(SessionEnd::Interrupted));
            }
            if self.guard.on_tick().is_some() {
                operator_prompt("memory limit reached; stopping automatically");
                return Ok(LoopOutcome::Exit(SessionEnd::MemoryLimit));
            }
            match self.poll_keys() {
                Some(ControlKey::SaveAndNext) => return Ok(LoopOutcome::SaveAndNext),
                Some(ControlKey::Exit) => return Ok(LoopOutcome::Exit(SessionEnd::Operator)),
                Some(ControlKey::Abort) => {
                    let dropped = self.buffer.discard();
                    warn!(dropped_frames = dropped, "episode aborted by operator");
                    operator_prompt("episode discarded; recording continues");
                    continue;
                }
                Some(ControlKey::Cancel) => {
                    self.cancel.cancel();
                    return Ok(LoopOutcome::Exit(SessionEnd::Interrupted));
                }
                Some(ControlKey::Proceed) | None => {}
            }

            // Once a second, a textual stand-in for the camera preview.
            if self.device.show_preview && ticks % u64::from(self.device.fps) == 0 {
                info!(
                    target: "telecap_preview",
                    episode_index = self.buffer.episode_index(),
                    frames = self.buffer.size(),
                    "recording"
                );
            }

            self.capture_tick(period).await?;
        }
    }

    /// Pulls one observation + action and appends it. A missing camera or
    /// state skips the tick without stalling the bus.
    async fn capture_tick(&mut self, deadline: Duration) -> anyhow::Result<()> {
        if !self.client.is_connected() {
            // The bridge may not be up yet (or dropped mid-session); keep
            // ticking and reconnect opportunistically.
            if self.client.connect().await.is_err() {
                return Ok(());
            }
        }

        let episode = self.buffer.episode_index();
        let frame_index = self.buffer.next_frame_index();

        let mut images = BTreeMap::new();
        for cam in &self.features.cameras {
            match self.client.latest_image(cam, deadline).await? {
                Some(image) => {
                    images.insert(cam.clone(), image);
                }
                None => return Ok(()),
            }
        }

        let Some(state) = self
            .client
            .latest_vector(topic::JOINT_FOLLOWER, deadline)
            .await?
        else {
            return Ok(());
        };
        // Before the teleop baseline exists there is no action stream;
        // record the held pose.
        let action = self
            .client
            .latest_vector(topic::ACTION_COMMAND, deadline)
            .await?
            .unwrap_or_else(|| state.clone());

        let frame = Frame {
            frame_index,
            episode_index: episode,
            timestamp: Frame::timestamp_for(frame_index, self.device.fps),
            state,
            images,
            action,
        };

        let mut paths = BTreeMap::new();
        for (cam, image) in frame.images {
            let path = self.layout.image_file(episode, &cam, frame.frame_index);
            paths.insert(cam.clone(), path.display().to_string());
            self.images.enqueue(ImageTask {
                episode_index: episode,
                image,
                path,
            })?;
        }
        self.buffer
            .append(frame.state.values, frame.action.values, paths);
        Ok(())
    }

    /// Swaps the buffer out and queues it. An empty buffer is skipped, not
    /// silently written.
    async fn queue_current_episode(&mut self, episodes_queued: &mut u64) -> anyhow::Result<u64> {
        let episode = self.buffer.episode_index();
        if self.buffer.size() == 0 {
            warn!(episode_index = episode, "no frames recorded; nothing to save");
            return Ok(0);
        }
        let taken = self.buffer.swap(episode + 1);
        let frames = taken.size() as u64;
        let depth = self
            .saver
            .queue_save(EpisodeSaveTask {
                buffer: taken,
                features: self.features.clone(),
                skip_encoding: self.device.offload.skip_local_encoding(),
            })
            .await?;
        *episodes_queued += 1;
        info!(
            episode_index = episode,
            frames,
            queue_depth = depth,
            "episode queued"
        );

        let status = self.saver.status();
        if status.total_failed > 0 {
            warn!(
                failed = status.total_failed,
                failed_episodes = ?status.failed_episodes,
                "previous episodes failed to save"
            );
        }
        Ok(frames)
    }

    /// Inter-episode reset: wait for `p`, auto-proceed after the timeout.
    /// Exit and cancel here run the identical full exit path as the main
    /// loop.
    async fn reset_phase(&mut self) -> Option<SessionEnd> {
        operator_prompt("reset the environment, then press p to continue");
        let deadline = tokio::time::Instant::now() + self.reset_timeout;
        loop {
            if self.cancel.is_cancelled() {
                return Some(SessionEnd::Interrupted);
            }
            if tokio::time::Instant::now() >= deadline {
                info!("reset timeout; proceeding to next episode");
                break;
            }
            match self.poll_keys() {
                Some(ControlKey::Proceed) => {
                    info!("reset confirmed");
                    break;
                }
                Some(ControlKey::Exit) => return Some(SessionEnd::Operator),
                Some(ControlKey::Cancel) => {
                    self.cancel.cancel();
                    return Some(SessionEnd::Interrupted);
                }
                Some(ControlKey::SaveAndNext) | Some(ControlKey::Abort) | None => {}
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let next = self.buffer.episode_index();
        operator_prompt(&format!("recording episode {next}"));
        None
    }

    fn poll_keys(&mut self) -> Option<ControlKey> {
        match self.keys.rx.try_recv() {
            Ok(key) => Some(key),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

/// Operator-facing prompt line (the voice frontend is out of scope; its
/// hook is this structured event).
pub fn operator_prompt(message: &str) {
    info!(target: "telecap_operator", prompt = message, "operator prompt");
}

/// Builds the starting buffer for a session.
pub fn fresh_buffer(device: &DeviceConfig) -> SharedEpisodeBuffer {
    SharedEpisodeBuffer::new(EpisodeBuffer::new(
        0,
        device.single_task.clone(),
        device.fps,
        &device.camera_names(),
    ))
}
