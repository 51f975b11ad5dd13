use std::path::{Path, PathBuf};

use telecap_core::types::CameraName;

/// On-disk dataset layout for one repo:
///
/// ```text
/// <root>/
///   data/episode_<N>.parquet
///   images/episode_<N>/observation.images.<cam>/frame_<F>.png
///   videos/episode_<N>/observation.images.<cam>.mp4
///   meta/info.json  meta/tasks.jsonl  meta/episodes.jsonl
/// ```
///
/// Episode indices are dense but not necessarily sequential in write order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetLayout {
    root: PathBuf,
}

impl DatasetLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_file(&self, episode: u64) -> PathBuf {
        self.root
            .join("data")
            .join(format!("episode_{episode:06}.parquet"))
    }

    pub fn episode_image_root(&self, episode: u64) -> PathBuf {
        self.root.join("images").join(format!("episode_{episode:06}"))
    }

    pub fn image_dir(&self, episode: u64, cam: &CameraName) -> PathBuf {
        self.episode_image_root(episode)
            .join(format!("observation.images.{}", cam.0))
    }

    pub fn image_file(&self, episode: u64, cam: &CameraName, frame: u64) -> PathBuf {
        self.image_dir(episode, cam).join(format!("frame_{frame:06}.png"))
    }

    pub fn video_file(&self, episode: u64, cam: &CameraName) -> PathBuf {
        self.root
            .join("videos")
            .join(format!("episode_{episode:06}"))
            .join(format!("observation.images.{}.mp4", cam.0))
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root.join("meta")
    }

    pub fn info_file(&self) -> PathBuf {
        self.meta_dir().join("info.json")
    }

    pub fn tasks_file(&self) -> PathBuf {
        self.meta_dir().join("tasks.jsonl")
    }

    pub fn episodes_file(&self) -> PathBuf {
        self.meta_dir().join("episodes.jsonl")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_stable_functions_of_the_index() {
        let layout = DatasetLayout::new("/data/repo");
        let cam = CameraName("top".to_string());
        assert_eq!(
            layout.data_file(3),
            PathBuf::from("/data/repo/data/episode_000003.parquet")
        );
        assert_eq!(
            layout.image_file(3, &cam, 12),
            PathBuf::from(
                "/data/repo/images/episode_000003/observation.images.top/frame_000012.png"
            )
        );
        assert_eq!(
            layout.video_file(3, &cam),
            PathBuf::from("/data/repo/videos/episode_000003/observation.images.top.mp4")
        );
    }
}
