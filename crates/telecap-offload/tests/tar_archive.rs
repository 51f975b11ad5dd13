//! The tar payload must mirror the dataset byte for byte: the edge server
//! extracts it in place of a per-file upload, so any divergence would
//! corrupt training data silently.

use std::path::{Path, PathBuf};

use telecap_core::config::EdgeConfig;
use telecap_offload::edge::EdgeUploader;

fn temp_dir(test_name: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    dir.push(format!(
        "telecap-tar-{}-{}-{}",
        test_name,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn uploader() -> EdgeUploader {
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

fn collect_files(root: &Path) -> Vec<(String, Vec<u8>)> {
    fn walk(dir: &Path, root: &Path, out: &mut Vec<(String, Vec<u8>)>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(&path, root, out);
            } else {
                let rel = path.strip_prefix(root).unwrap().display().to_string();
                out.push((rel, std::fs::read(&path).unwrap()));
            }
        }
    }
    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

#[tokio::test]
async fn tar_archive_preserves_the_dataset_byte_for_byte() -> anyhow::Result<()> {
    let base = temp_dir("mirror");
    let dataset = base.join("repo_a");
    std::fs::create_dir_all(dataset.join("data"))?;
    std::fs::create_dir_all(dataset.join("images/episode_000000/observation.images.top"))?;
    std::fs::write(dataset.join("data/episode_000000.parquet"), vec![7u8; 4096])?;
    std::fs::write(
        dataset.join("images/episode_000000/observation.images.top/frame_000000.png"),
        vec![1u8, 2, 3, 4],
    )?;
    std::fs::write(dataset.join("meta-info"), b"{}")?;

    let tar_path = uploader().create_tar_archive(&dataset).await?;
    assert!(tar_path.exists());

    // Extract into a scratch dir the way the edge server does.
    let extract = base.join("extracted");
    std::fs::create_dir_all(&extract)?;
    let status = std::process::Command::new("tar")
        .arg("xf")
        .arg(&tar_path)
        .arg("-C")
        .arg(&extract)
        .status()?;
    assert!(status.success());

    let original = collect_files(&dataset);
    let roundtrip = collect_files(&extract.join("repo_a"));
    assert_eq!(original, roundtrip);

    std::fs::remove_file(tar_path)?;
    std::fs::remove_dir_all(base)?;
    Ok(())
}
