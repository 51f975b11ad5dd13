//! Append-only dataset metadata.
//!
//! `meta/episodes.jsonl` gains one record per saved episode, in completion
//! order (which may differ from index order). `meta/info.json` is rewritten
//! atomically after each save. File counts are never used as a completeness
//! signal; failed async saves legitimately leave gaps.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::buffer::{EpisodeBuffer, Features};
use crate::layout::DatasetLayout;
use crate::DatasetError;

pub const CODEBASE_VERSION: &str = "v2.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub codebase_version: String,
    pub repo_id: String,
    pub fps: u32,
    pub total_episodes: u64,
    pub total_frames: u64,
    pub features: Features,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeStats {
    pub state_min: Vec<f32>,
    pub state_max: Vec<f32>,
    pub state_mean: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub episode_index: u64,
    pub length: u64,
    pub task: String,
    pub stats: EpisodeStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TaskRecord {
    task_index: u64,
    task: String,
}

pub fn episode_stats(buffer: &EpisodeBuffer) -> EpisodeStats {
    let dim = buffer.states.first().map(Vec::len).unwrap_or(0);
    let mut min = vec![f32::INFINITY; dim];
    let mut max = vec![f32::NEG_INFINITY; dim];
    let mut sum = vec![0.0f64; dim];
    for row in &buffer.states {
        for (i, &v) in row.iter().enumerate().take(dim) {
            min[i] = min[i].min(v);
            max[i] = max[i].max(v);
            sum[i] += f64::from(v);
        }
    }
    let n = buffer.states.len().max(1) as f64;
    EpisodeStats {
        state_min: min,
        state_max: max,
        state_mean: sum.iter().map(|&s| (s / n) as f32).collect(),
    }
}

/// Owner of the `meta/` directory for one session.
#[derive(Debug)]
pub struct DatasetMetadata {
    layout: DatasetLayout,
    info: DatasetInfo,
}

impl DatasetMetadata {
    /// Creates `meta/` with an empty episode log, a single-task table, and
    /// the feature schema.
    pub fn init(
        layout: DatasetLayout,
        repo_id: &str,
        task: &str,
        fps: u32,
        features: Features,
    ) -> Result<Self, DatasetError> {
        std::fs::create_dir_all(layout.meta_dir())?;
        let info = DatasetInfo {
            codebase_version: CODEBASE_VERSION.to_string(),
            repo_id: repo_id.to_string(),
            fps,
            total_episodes: 0,
            total_frames: 0,
            features,
        };
        let meta = Self { layout, info };
        meta.write_info()?;

        let task_line = serde_json::to_string(&TaskRecord {
            task_index: 0,
            task: task.to_string(),
        })?;
        meta.replace_file(&meta.layout.tasks_file(), format!("{task_line}\n").as_bytes())?;
        // Touch the episode log so a zero-episode session still has a
        // complete meta/ directory.
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(meta.layout.episodes_file())?;
        Ok(meta)
    }

    pub fn info(&self) -> &DatasetInfo {
        &self.info
    }

    /// Records one saved episode: appends to the episode log and rewrites
    /// `info.json` atomically.
    pub fn append_episode(&mut self, record: &EpisodeRecord) -> Result<(), DatasetError> {
        let line = serde_json::to_string(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.layout.episodes_file())?;
        file.write_all(format!("{line}\n").as_bytes())?;
        file.sync_all()?;

        self.info.total_episodes += 1;
        self.info.total_frames += record.length;
        self.write_info()
    }

    fn write_info(&self) -> Result<(), DatasetError> {
        let bytes = serde_json::to_vec_pretty(&self.info)?;
        self.replace_file(&self.layout.info_file(), &bytes)
    }

    /// Rewrites one meta file through a pid-scoped scratch sibling and a
    /// rename, so a concurrent reader never observes a half-written
    /// document.
    fn replace_file(&self, path: &Path, bytes: &[u8]) -> Result<(), DatasetError> {
        std::fs::create_dir_all(self.layout.meta_dir())?;
        let scratch = path.with_extension(format!("partial.{}", std::process::id()));
        {
            let mut file = std::fs::File::create(&scratch)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&scratch, path)?;
        Ok(())
    }

    pub fn read_episode_records(&self) -> Result<Vec<EpisodeRecord>, DatasetError> {
        let text = std::fs::read_to_string(self.layout.episodes_file())?;
        let mut records = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(line)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use telecap_core::types::CameraName;

    fn temp_layout(test_name: &str) -> DatasetLayout {
        let mut root = std::env::temp_dir();
        root.push(format!(
            "telecap-meta-{}-{}-{}",
            test_name,
            std::process::id(),
            telecap_observe::time::unix_time_ms()
        ));
        DatasetLayout::new(root)
    }

    fn features() -> Features {
        Features {
            state_dim: 7,
            action_dim: 7,
            cameras: vec![CameraName("top".to_string())],
            image_width: 640,
            image_height: 480,
        }
    }

    #[test]
    fn init_then_append_updates_totals() -> anyhow::Result<()> {
        let layout = temp_layout("append");
        let mut meta = DatasetMetadata::init(layout.clone(), "repo", "pick", 30, features())?;
        assert_eq!(meta.info().total_episodes, 0);

        let mut buf = EpisodeBuffer::new(0, "pick", 30, &[CameraName("top".to_string())]);
        for i in 0..4u64 {
            let mut paths = BTreeMap::new();
            paths.insert(CameraName("top".to_string()), format!("f{i}.png"));
            buf.append(vec![i as f32, 2.0 * i as f32], vec![0.0, 0.0], paths);
        }
        let record = EpisodeRecord {
            episode_index: 0,
            length: buf.size() as u64,
            task: "pick".to_string(),
            stats: episode_stats(&buf),
        };
        meta.append_episode(&record)?;

        assert_eq!(meta.info().total_episodes, 1);
        assert_eq!(meta.info().total_frames, 4);

        let records = meta.read_episode_records()?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stats.state_min, vec![0.0, 0.0]);
        assert_eq!(records[0].stats.state_max, vec![3.0, 6.0]);
        assert_eq!(records[0].stats.state_mean, vec![1.5, 3.0]);

        // info.json round-trips.
        let text = std::fs::read_to_string(layout.info_file())?;
        let info: DatasetInfo = serde_json::from_str(&text)?;
        assert_eq!(info.total_frames, 4);

        std::fs::remove_dir_all(layout.root())?;
        Ok(())
    }

    #[test]
    fn out_of_order_appends_are_preserved_in_completion_order() -> anyhow::Result<()> {
        let layout = temp_layout("order");
        let mut meta = DatasetMetadata::init(layout.clone(), "repo", "pick", 30, features())?;
        for index in [2u64, 0, 1] {
            meta.append_episode(&EpisodeRecord {
                episode_index: index,
                length: 1,
                task: "pick".to_string(),
                stats: EpisodeStats {
                    state_min: vec![],
                    state_max: vec![],
                    state_mean: vec![],
                },
            })?;
        }
        let records = meta.read_episode_records()?;
        let order: Vec<u64> = records.iter().map(|r| r.episode_index).collect();
        assert_eq!(order, vec![2, 0, 1]);
        std::fs::remove_dir_all(layout.root())?;
        Ok(())
    }
}
