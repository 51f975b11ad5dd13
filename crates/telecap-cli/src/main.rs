#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! `telecap`: records synchronized teleoperation episodes and hands the
//! dataset off for training.
//!
//! Exit codes: 0 clean, 1 config/permission failure, 2 device/startup
//! failure, 3 offload failure with local data intact, 130 interrupted.

mod keys;
mod memory;
mod record;
mod supervisor;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use telecap_core::config::{
    ApiConfig, ConfigFile, DeviceConfig, EdgeConfig, MEMORY_CHECK_INTERVAL_TICKS,
};
use telecap_dataset::buffer::Features;
use telecap_dataset::encoder::FfmpegEncoder;
use telecap_dataset::image_writer::ImageWriterPool;
use telecap_dataset::layout::DatasetLayout;
use telecap_dataset::meta::DatasetMetadata;
use telecap_dataset::saver::{AsyncEpisodeSaver, SaverConfig};
use telecap_offload::api::HttpTrainingService;
use telecap_offload::edge::EdgeUploader;
use telecap_offload::orchestrator::{Orchestrator, ResumeOptions};
use telecap_offload::poll::PollConfig;
use telecap_wire::client::BridgeClient;

use crate::keys::KeyListener;
use crate::memory::MemoryGuard;
use crate::record::{fresh_buffer, RecordSession, SessionEnd};
use crate::supervisor::{check_device_permissions, GraphSupervisor};

const EXIT_CLEAN: u8 = 0;
const EXIT_CONFIG: u8 = 1;
const EXIT_STARTUP: u8 = 2;
const EXIT_OFFLOAD: u8 = 3;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug, Parser)]
#[command(name = "telecap")]
struct Args {
    /// Optional key=value device-config file (env still wins per field).
    #[arg(long, env = "TELECAP_CONFIG")]
    config: Option<PathBuf>,

    /// Dataset root; the repo directory is created beneath it.
    #[arg(long, env = "TELECAP_DATASET_ROOT")]
    dataset_root: Option<PathBuf>,

    /// Where the trained model lands after offload.
    #[arg(long, env = "TELECAP_MODEL_DIR")]
    model_dir: Option<PathBuf>,

    #[arg(long, env = "TELECAP_RUNTIME_DIR", default_value = "/tmp/telecap")]
    runtime_dir: PathBuf,

    /// Settle delay after graph start so adapters finish device detection.
    #[arg(long, env = "TELECAP_SETTLE_S", default_value_t = 5)]
    settle_s: u64,

    #[arg(long, env = "TELECAP_COUNTDOWN_S", default_value_t = 3)]
    countdown_s: u64,

    /// Resume: remote already has the data; start at the training trigger.
    #[arg(long)]
    skip_upload: bool,

    /// Resume: training already completed; only download the model.
    #[arg(long)]
    download_only: bool,

    /// Disable the tar-based transfer and mirror file-by-file instead.
    #[arg(long)]
    no_tar: bool,

    #[arg(long, env = "TELECAP_SAVE_WORKERS", default_value_t = 1)]
    save_workers: usize,

    #[arg(long, env = "TELECAP_IMAGE_WORKERS", default_value_t = 4)]
    image_workers: usize,
}

fn main() -> ExitCode {
    telecap_observe::logging::init_tracing();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            error!(error = %err, "failed to start runtime");
            return ExitCode::from(EXIT_STARTUP);
        }
    };
    let code = runtime.block_on(run());
    ExitCode::from(code)
}

async fn run() -> u8 {
    let args = Args::parse();

    let file = match load_config_file(&args) {
        Ok(file) => file,
        Err(err) => {
            error!(error = %err, "config file unreadable");
            return EXIT_CONFIG;
        }
    };
    let device = match DeviceConfig::resolve(file.as_ref()) {
        Ok(device) => device,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return EXIT_CONFIG;
        }
    };
    let edge_cfg = EdgeConfig::resolve(file.as_ref());
    let api_cfg = ApiConfig::resolve(file.as_ref());
    info!(
        repo_id = %device.repo_id,
        mode = %device.offload,
        fps = device.fps,
        "telecap starting"
    );

    if let Err(msg) = check_device_permissions(&[device.leader_port.as_str(), device.follower_port.as_str()]) {
        error!("{msg}");
        return EXIT_CONFIG;
    }

    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let dataset_root = args
        .dataset_root
        .clone()
        .unwrap_or_else(|| home.join("telecap").join("dataset"));
    let target_dir = dataset_root.join(&device.repo_id);
    let model_dir = args
        .model_dir
        .clone()
        .unwrap_or_else(|| home.join("telecap").join("model"));

    let service = match HttpTrainingService::new(api_cfg.clone()) {
        Ok(service) => service,
        Err(err) => {
            error!(error = %err, "http client setup failed");
            return EXIT_STARTUP;
        }
    };
    let uploader = EdgeUploader::new(edge_cfg, api_cfg.username.clone());
    let orchestrator = Orchestrator::new(device.offload, uploader, service, PollConfig::default());

    let cancel = CancellationToken::new();
    let hard_cancel = CancellationToken::new();
    spawn_signal_task(cancel.clone(), hard_cancel.clone());

    // Resume invocations skip the whole capture phase.
    if args.skip_upload || args.download_only {
        let resume = ResumeOptions {
            skip_upload: args.skip_upload,
            download_only: args.download_only,
            use_tar: !args.no_tar,
        };
        info!(skip_upload = args.skip_upload, download_only = args.download_only, "resume mode");
        return match orchestrator
            .run(&target_dir, &device.repo_id, &model_dir, resume, &cancel)
            .await
        {
            Ok(_) => EXIT_CLEAN,
            Err(err) => {
                error!(error = %err, "offload resume failed");
                EXIT_OFFLOAD
            }
        };
    }

    // Fresh-session semantics: stale data or a stale model would poison
    // training and inference.
    if let Err(err) = clear_dir(&target_dir).and_then(|_| clear_dir(&model_dir)) {
        error!(error = %err, "cannot prepare session directories");
        return EXIT_STARTUP;
    }

    let mut graph = match GraphSupervisor::new(&args.runtime_dir, Duration::from_secs(args.settle_s))
    {
        Ok(graph) => graph,
        Err(err) => {
            error!(error = %err, "supervisor setup failed");
            return EXIT_STARTUP;
        }
    };
    if let Err(err) = graph.clean_stale().await {
        error!(error = %err, "stale-state cleanup failed");
        return EXIT_STARTUP;
    }
    if let Err(err) = graph.start_graph(&device).await {
        error!(error = %err, "graph startup failed");
        graph.shutdown().await;
        return EXIT_STARTUP;
    }
    if let Err(err) = graph.wait_for_cli_sockets().await {
        error!(error = %err, "bridge sockets never appeared");
        graph.shutdown().await;
        return EXIT_STARTUP;
    }
    graph.settle().await;

    // Adapters may have re-created device nodes during detection.
    if let Err(msg) = check_device_permissions(&[device.leader_port.as_str(), device.follower_port.as_str()]) {
        error!("{msg}");
        graph.shutdown().await;
        return EXIT_CONFIG;
    }

    // Offload modes must know the remote is reachable before any data is
    // collected; a failure here is startup feedback, not data loss.
    if let Err(err) = orchestrator.probe().await {
        error!(error = %err, "connection probe failed");
        graph.shutdown().await;
        return EXIT_STARTUP;
    }

    let layout = DatasetLayout::new(&target_dir);
    let features = Features {
        state_dim: device.leader_joints.len(),
        action_dim: device.leader_joints.len(),
        cameras: device.camera_names(),
        image_width: 640,
        image_height: 480,
    };
    let meta = match DatasetMetadata::init(
        layout.clone(),
        &device.repo_id,
        &device.single_task,
        device.fps,
        features.clone(),
    ) {
        Ok(meta) => meta,
        Err(err) => {
            error!(error = %err, "dataset metadata init failed");
            graph.shutdown().await;
            return EXIT_STARTUP;
        }
    };

    let images = Arc::new(ImageWriterPool::new(args.image_workers));
    let encoder = Arc::new(FfmpegEncoder::new(device.hardware_encoder));
    let saver = AsyncEpisodeSaver::with_hard_cancel(
        layout.clone(),
        meta,
        images.clone(),
        encoder,
        SaverConfig {
            workers: args.save_workers,
            ..SaverConfig::default()
        },
        hard_cancel,
    );

    let session = RecordSession {
        device: &device,
        layout: layout.clone(),
        features,
        client: BridgeClient::new(graph.socket_paths()),
        buffer: fresh_buffer(&device),
        images: images.clone(),
        saver: &saver,
        keys: KeyListener::spawn(),
        guard: MemoryGuard::new(device.memory_limit_gb, MEMORY_CHECK_INTERVAL_TICKS),
        cancel: cancel.clone(),
        countdown: Duration::from_secs(args.countdown_s),
        reset_timeout: record::RESET_TIMEOUT,
    };

    let summary = match session.run().await {
        Ok(summary) => summary,
        Err(err) => {
            error!(error = %err, "record loop failed");
            graph.shutdown().await;
            let _ = saver.stop(false).await;
            return EXIT_STARTUP;
        }
    };

    // Disconnect hardware before the heavy save/encode wait so a slow
    // encode cannot hold serial ports open.
    graph.shutdown().await;

    let status = saver.stop(true).await;
    info!(
        queued = status.total_queued,
        completed = status.total_completed,
        failed = status.total_failed,
        failed_episodes = ?status.failed_episodes,
        "save statistics"
    );
    match Arc::try_unwrap(images) {
        Ok(pool) => pool.shutdown().await,
        Err(_) => warn!("image pool still referenced at shutdown"),
    }

    let resume = ResumeOptions {
        use_tar: !args.no_tar,
        ..ResumeOptions::fresh()
    };
    if let Err(err) = orchestrator
        .run(&target_dir, &device.repo_id, &model_dir, resume, &cancel)
        .await
    {
        error!(
            error = %err,
            dataset = %target_dir.display(),
            "offload failed; local data preserved"
        );
        return EXIT_OFFLOAD;
    }

    if summary.end == SessionEnd::Interrupted {
        return EXIT_INTERRUPTED;
    }
    EXIT_CLEAN
}

fn load_config_file(args: &Args) -> Result<Option<ConfigFile>, telecap_core::config::ConfigError> {
    match &args.config {
        Some(path) => Ok(Some(ConfigFile::load(path)?)),
        None => Ok(None),
    }
}

fn clear_dir(path: &PathBuf) -> std::io::Result<()> {
    let has_content = std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false);
    if has_content {
        warn!(path = %path.display(), "clearing existing contents");
        std::fs::remove_dir_all(path)?;
    }
    std::fs::create_dir_all(path)
}

/// First signal cancels gracefully (queued saves still complete); a second
/// escalates and abandons queued work at the next task boundary.
fn spawn_signal_task(cancel: CancellationToken, hard_cancel: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(_) => return,
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return,
        };

        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        info!("signal received; finishing queued work (send again to abandon)");
        cancel.cancel();

        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        warn!("second signal; abandoning queued saves");
        hard_cancel.cancel();
    });
}
