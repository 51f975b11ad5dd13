use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `TELECAP_LOG` first, then
/// `RUST_LOG`, then a default.
///
/// Log field contract for telecap processes:
/// - Always include `repo_id` when available.
/// - Include `episode_index` on any buffer/save/encode event.
/// - Include `node` and `topic` on dataflow events.
/// - Include `mode` on any offload event.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("TELECAP_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
