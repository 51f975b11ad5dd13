//! The in-progress episode buffer.
//!
//! Appends happen on the record loop at tick rate; promotion to the save
//! pipeline swaps the whole buffer for a fresh one under the lock, so the
//! recording thread never observes a partially drained buffer and the saver
//! receives an owned value.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use telecap_core::types::CameraName;

use crate::DatasetError;

/// Feature schema shared by every episode of one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    pub state_dim: usize,
    pub action_dim: usize,
    pub cameras: Vec<CameraName>,
    pub image_width: u32,
    pub image_height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeBuffer {
    pub episode_index: u64,
    pub task: String,
    pub fps: u32,
    pub frame_indices: Vec<u64>,
    pub timestamps: Vec<f64>,
    pub states: Vec<Vec<f32>>,
    pub actions: Vec<Vec<f32>>,
    /// Relative PNG paths per camera, one entry per frame.
    pub image_paths: BTreeMap<CameraName, Vec<String>>,
    size: usize,
}

impl EpisodeBuffer {
    pub fn new(episode_index: u64, task: impl Into<String>, fps: u32, cameras: &[CameraName]) -> Self {
        Self {
            episode_index,
            task: task.into(),
            fps,
            frame_indices: Vec::new(),
            timestamps: Vec::new(),
            states: Vec::new(),
            actions: Vec::new(),
            image_paths: cameras.iter().map(|c| (c.clone(), Vec::new())).collect(),
            size: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn next_frame_index(&self) -> u64 {
        self.size as u64
    }

    /// Appends one frame. Timestamps are derived, never sampled.
    pub fn append(
        &mut self,
        state: Vec<f32>,
        action: Vec<f32>,
        image_paths: BTreeMap<CameraName, String>,
    ) -> u64 {
        let frame_index = self.size as u64;
        self.frame_indices.push(frame_index);
        self.timestamps
            .push(frame_index as f64 / f64::from(self.fps));
        self.states.push(state);
        self.actions.push(action);
        for (cam, paths) in self.image_paths.iter_mut() {
            if let Some(path) = image_paths.get(cam) {
                paths.push(path.clone());
            }
        }
        self.size += 1;
        frame_index
    }

    /// Checks the buffer invariants: every column as long as `size`, and
    /// timestamps strictly increasing with step `1/fps`.
    pub fn check(&self) -> Result<(), DatasetError> {
        if self.size == 0 {
            return Err(DatasetError::Validation(format!(
                "episode {} has zero frames",
                self.episode_index
            )));
        }
        let n = self.size;
        for (key, len) in [
            ("frame_index", self.frame_indices.len()),
            ("timestamp", self.timestamps.len()),
            ("observation.state", self.states.len()),
            ("action", self.actions.len()),
        ] {
            if len != n {
                return Err(DatasetError::Validation(format!(
                    "episode {}: column {key} has {len} entries, expected {n}",
                    self.episode_index
                )));
            }
        }
        for (cam, paths) in &self.image_paths {
            if paths.len() != n {
                return Err(DatasetError::Validation(format!(
                    "episode {}: camera {} has {} frames, expected {n}",
                    self.episode_index,
                    cam.0,
                    paths.len()
                )));
            }
        }
        let step = 1.0 / f64::from(self.fps);
        for (i, pair) in self.timestamps.windows(2).enumerate() {
            let delta = pair[1] - pair[0];
            if delta <= 0.0 || (delta - step).abs() > 1e-9 {
                return Err(DatasetError::Validation(format!(
                    "episode {}: timestamp step {delta} at frame {i} (expected {step})",
                    self.episode_index
                )));
            }
        }
        Ok(())
    }
}

/// The record loop's handle: one append or one swap per lock acquisition,
/// never held across IO.
#[derive(Debug, Clone)]
pub struct SharedEpisodeBuffer {
    inner: Arc<Mutex<EpisodeBuffer>>,
}

impl SharedEpisodeBuffer {
    pub fn new(buffer: EpisodeBuffer) -> Self {
        Self {
            inner: Arc::new(Mutex::new(buffer)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EpisodeBuffer> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn append(
        &self,
        state: Vec<f32>,
        action: Vec<f32>,
        image_paths: BTreeMap<CameraName, String>,
    ) -> u64 {
        self.lock().append(state, action, image_paths)
    }

    pub fn size(&self) -> usize {
        self.lock().size()
    }

    pub fn episode_index(&self) -> u64 {
        self.lock().episode_index
    }

    pub fn next_frame_index(&self) -> u64 {
        self.lock().next_frame_index()
    }

    /// Atomically replaces the live buffer with a fresh one for
    /// `next_episode_index` and returns the full previous buffer.
    pub fn swap(&self, next_episode_index: u64) -> EpisodeBuffer {
        let mut guard = self.lock();
        let cameras: Vec<CameraName> = guard.image_paths.keys().cloned().collect();
        let fresh = EpisodeBuffer::new(next_episode_index, guard.task.clone(), guard.fps, &cameras);
        std::mem::replace(&mut *guard, fresh)
    }

    /// Discards the current buffer contents (operator abort).
    pub fn discard(&self) -> usize {
        let mut guard = self.lock();
        let cameras: Vec<CameraName> = guard.image_paths.keys().cloned().collect();
        let dropped = guard.size();
        let index = guard.episode_index;
        let fresh = EpisodeBuffer::new(index, guard.task.clone(), guard.fps, &cameras);
        *guard = fresh;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cams() -> Vec<CameraName> {
        vec![CameraName("top".to_string()), CameraName("wrist".to_string())]
    }

    fn paths_for(frame: u64) -> BTreeMap<CameraName, String> {
        cams()
            .into_iter()
            .map(|c| {
                let path = format!("observation.images.{}/frame_{frame:06}.png", c.0);
                (c, path)
            })
            .collect()
    }

    #[test]
    fn append_keeps_columns_aligned() {
        let mut buf = EpisodeBuffer::new(0, "pick", 30, &cams());
        for i in 0..5 {
            let idx = buf.append(vec![0.0; 7], vec![0.0; 7], paths_for(i));
            assert_eq!(idx, i);
        }
        assert_eq!(buf.size(), 5);
        buf.check().unwrap();
    }

    #[test]
    fn timestamps_step_by_one_over_fps() {
        let mut buf = EpisodeBuffer::new(0, "pick", 30, &cams());
        for i in 0..10 {
            buf.append(vec![0.0], vec![0.0], paths_for(i));
        }
        for (i, ts) in buf.timestamps.iter().enumerate() {
            assert!((ts - i as f64 / 30.0).abs() < 1e-12);
        }
    }

    #[test]
    fn zero_frame_buffer_fails_validation() {
        let buf = EpisodeBuffer::new(7, "pick", 30, &cams());
        let err = buf.check().unwrap_err();
        assert!(err.to_string().contains("zero frames"));
    }

    #[test]
    fn swap_returns_full_buffer_and_resets_live_one() {
        let shared = SharedEpisodeBuffer::new(EpisodeBuffer::new(0, "pick", 30, &cams()));
        for i in 0..20 {
            shared.append(vec![1.0; 7], vec![2.0; 7], paths_for(i));
        }

        let taken = shared.swap(1);
        assert_eq!(taken.size(), 20);
        assert_eq!(taken.episode_index, 0);
        taken.check().unwrap();
        for (_, paths) in &taken.image_paths {
            assert_eq!(paths.len(), 20);
        }

        assert_eq!(shared.size(), 0);
        assert_eq!(shared.episode_index(), 1);
    }

    #[test]
    fn swap_under_concurrent_appends_never_tears() {
        let shared = SharedEpisodeBuffer::new(EpisodeBuffer::new(0, "pick", 30, &cams()));
        let writer = {
            let shared = shared.clone();
            std::thread::spawn(move || {
                for i in 0..500u64 {
                    shared.append(vec![i as f32], vec![i as f32], paths_for(i));
                }
            })
        };

        let mut collected = 0usize;
        let mut swaps = 1u64;
        while collected < 500 {
            let taken = shared.swap(swaps);
            swaps += 1;
            if taken.size() > 0 {
                // Every swapped-out buffer satisfies the invariants in full.
                taken.check().unwrap();
                collected += taken.size();
            }
        }
        writer.join().unwrap();
        assert_eq!(collected, 500);
    }

    #[test]
    fn discard_drops_frames_in_place() {
        let shared = SharedEpisodeBuffer::new(EpisodeBuffer::new(4, "pick", 30, &cams()));
        for i in 0..3 {
            shared.append(vec![0.0], vec![0.0], paths_for(i));
        }
        assert_eq!(shared.discard(), 3);
        assert_eq!(shared.size(), 0);
        assert_eq!(shared.episode_index(), 4);
    }
}
