//! Single-threaded event loop shared by every dataflow node.
//!
//! A node sees three kinds of events: timer ticks at the bus period, typed
//! inputs pushed by the bridge hub, and a stop request (hub `Stop` frame,
//! process signal, or hub connection loss). Lifecycle:
//! `Starting → Connecting → Running → Draining → Stopped`. Draining emits
//! nothing and must release devices before the process exits; the runtime
//! escalates after [`RunnerConfig::drain_deadline`].

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use telecap_observe::metrics::{Counter, DurationAgg};
use telecap_wire::{read_message, write_message, Message, Payload};

use crate::NodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Starting,
    Connecting,
    Running,
    Draining,
    Stopped,
}

impl NodeState {
    fn as_str(self) -> &'static str {
        match self {
            NodeState::Starting => "starting",
            NodeState::Connecting => "connecting",
            NodeState::Running => "running",
            NodeState::Draining => "draining",
            NodeState::Stopped => "stopped",
        }
    }
}

/// One emitted output on a declared topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub topic: String,
    pub payload: Payload,
}

impl Output {
    pub fn new(topic: impl Into<String>, payload: Payload) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

/// A dataflow node. Handlers are synchronous; the runner owns all socket IO.
pub trait Node: Send {
    fn name(&self) -> &str;

    /// Input topics the hub should push to this node.
    fn subscriptions(&self) -> Vec<String> {
        Vec::new()
    }

    /// Opens owned devices. Retried by the runner on failure.
    fn on_start(&mut self) -> Result<(), NodeError>;

    fn on_tick(&mut self) -> Result<Vec<Output>, NodeError>;

    fn on_input(&mut self, topic: &str, payload: &Payload) -> Result<Vec<Output>, NodeError>;

    /// Releases owned devices. Must tolerate repeated calls.
    fn on_stop(&mut self);
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub hub_socket: PathBuf,
    pub period: Duration,
    /// Device-open attempts before `NodeStartupFailure`.
    pub start_attempts: u32,
    pub connect_attempts: u32,
    pub retry_backoff: Duration,
    /// How long Draining may take to release devices before escalation.
    pub drain_deadline: Duration,
    /// Consecutive-error window for `NodeCommunicationFailure`.
    pub comm_window: Duration,
    /// How long a node may stay degraded before the failure is fatal.
    pub degraded_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            hub_socket: PathBuf::from("/tmp/telecap/hub.sock"),
            period: Duration::from_millis(33),
            start_attempts: 3,
            connect_attempts: 10,
            retry_backoff: Duration::from_millis(500),
            drain_deadline: Duration::from_secs(2),
            comm_window: Duration::from_secs(1),
            degraded_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default)]
pub struct NodeMetrics {
    pub ticks_total: Counter,
    pub overruns_total: Counter,
    pub inputs_total: Counter,
    pub outputs_total: Counter,
    pub comm_errors_total: Counter,
    pub tick_duration: DurationAgg,
}

impl NodeMetrics {
    fn snapshot(&self, node: &str) {
        let ticks = self.tick_duration.summary();
        info!(
            target: "telecap_metrics",
            node = node,
            ticks_total = self.ticks_total.get(),
            overruns_total = self.overruns_total.get(),
            inputs_total = self.inputs_total.get(),
            outputs_total = self.outputs_total.get(),
            comm_errors_total = self.comm_errors_total.get(),
            tick_mean_us = ticks.mean_us(),
            tick_peak_us = ticks.peak_us,
            "metrics"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommVerdict {
    /// Below threshold; keep running.
    Tolerated,
    /// Three strikes inside the window; node is degraded.
    Degraded,
    /// Degraded past the grace window.
    Fatal,
}

/// Tracks consecutive read/write errors against the 3-in-1s rule.
#[derive(Debug)]
pub struct CommTracker {
    window: Duration,
    grace: Duration,
    consecutive: u32,
    window_start: Option<Instant>,
    degraded_since: Option<Instant>,
}

impl CommTracker {
    pub fn new(window: Duration, grace: Duration) -> Self {
        Self {
            window,
            grace,
            consecutive: 0,
            window_start: None,
            degraded_since: None,
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn on_ok(&mut self) {
        self.consecutive = 0;
        self.window_start = None;
        self.degraded_since = None;
    }

    pub fn on_error(&mut self, now: Instant) -> CommVerdict {
        match self.window_start {
            Some(start) if now.duration_since(start) <= self.window => {
                self.consecutive += 1;
            }
            _ => {
                self.window_start = Some(now);
                self.consecutive = 1;
            }
        }

        // Degraded is sticky: only a successful call clears it.
        if self.degraded_since.is_some() || self.consecutive >= 3 {
            let degraded_since = *self.degraded_since.get_or_insert(now);
            if now.duration_since(degraded_since) > self.grace {
                return CommVerdict::Fatal;
            }
            return CommVerdict::Degraded;
        }
        CommVerdict::Tolerated
    }
}

enum Incoming {
    Input { topic: String, payload: Payload },
    Stop,
    Closed,
}

/// Runs one node to completion. Returns `Ok(())` after a clean drain and the
/// fatal `NodeError` otherwise; devices are released on every path.
pub async fn run_node(
    mut node: Box<dyn Node>,
    cfg: RunnerConfig,
    cancel: CancellationToken,
) -> Result<(), NodeError> {
    let name = node.name().to_string();
    let name = name.as_str();
    let metrics = NodeMetrics::default();
    log_state(name, NodeState::Starting);

    if let Err(err) = start_with_retries(node.as_mut(), &cfg).await {
        // Opening failed; nothing to drain but close anyway for symmetry.
        node.on_stop();
        return Err(err);
    }

    log_state(name, NodeState::Connecting);
    let stream = match connect_with_retries(&cfg).await {
        Ok(stream) => stream,
        Err(err) => {
            release(node, name, cfg.drain_deadline).await;
            return Err(err);
        }
    };
    let (read_half, mut write_half) = stream.into_split();

    let subscribe = Message::Subscribe {
        topics: node.subscriptions(),
    };
    if let Err(err) = write_message(&mut write_half, &subscribe).await {
        release(node, name, cfg.drain_deadline).await;
        return Err(err.into());
    }

    // Inputs are read by a dedicated task so the select loop never abandons
    // a half-read frame.
    let (incoming_tx, mut incoming_rx) = mpsc::channel::<Incoming>(64);
    let reader = tokio::spawn(read_loop(read_half, incoming_tx));

    log_state(name, NodeState::Running);
    let mut interval = tokio::time::interval(cfg.period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut comm = CommTracker::new(cfg.comm_window, cfg.degraded_grace);

    let mut fatal: Option<NodeError> = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(node = name, "stop requested by signal");
                break;
            }
            _ = interval.tick() => {
                metrics.ticks_total.inc();
                let started = Instant::now();
                let result = node.on_tick();
                let elapsed = started.elapsed();
                metrics.tick_duration.record(elapsed);
                if elapsed > cfg.period {
                    metrics.overruns_total.inc();
                    warn!(
                        node = name,
                        elapsed_ms = elapsed.as_millis() as u64,
                        period_ms = cfg.period.as_millis() as u64,
                        "tick handler overran the period"
                    );
                }
                match handle_result(name, result, &mut comm, &metrics, &mut write_half).await {
                    Ok(()) => {}
                    Err(err) => { fatal = Some(err); break; }
                }
            }
            incoming = incoming_rx.recv() => {
                match incoming {
                    Some(Incoming::Input { topic, payload }) => {
                        metrics.inputs_total.inc();
                        let result = node.on_input(&topic, &payload);
                        match handle_result(name, result, &mut comm, &metrics, &mut write_half).await {
                            Ok(()) => {}
                            Err(err) => { fatal = Some(err); break; }
                        }
                    }
                    Some(Incoming::Stop) => {
                        info!(node = name, "stop event from hub");
                        break;
                    }
                    Some(Incoming::Closed) | None => {
                        info!(node = name, "hub connection closed, draining");
                        break;
                    }
                }
            }
        }
    }

    log_state(name, NodeState::Draining);
    reader.abort();
    // Flush outstanding writes before the device release; Draining emits no
    // new outputs.
    {
        use tokio::io::AsyncWriteExt;
        let _ = write_half.shutdown().await;
    }
    release(node, name, cfg.drain_deadline).await;
    metrics.snapshot(name);
    log_state(name, NodeState::Stopped);

    match fatal {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn log_state(node: &str, state: NodeState) {
    info!(
        target: "telecap_proof",
        event = "node_state",
        node = node,
        state = state.as_str(),
        "node state changed"
    );
}

async fn start_with_retries(node: &mut dyn Node, cfg: &RunnerConfig) -> Result<(), NodeError> {
    let mut last: Option<NodeError> = None;
    for attempt in 1..=cfg.start_attempts {
        match node.on_start() {
            Ok(()) => return Ok(()),
            Err(err) => {
                warn!(node = node.name(), attempt, error = %err, "device open failed");
                last = Some(err);
                tokio::time::sleep(cfg.retry_backoff).await;
            }
        }
    }
    Err(NodeError::Startup(format!(
        "device open failed after {} attempts: {}",
        cfg.start_attempts,
        last.map(|e| e.to_string()).unwrap_or_default()
    )))
}

async fn connect_with_retries(cfg: &RunnerConfig) -> Result<UnixStream, NodeError> {
    let mut last: Option<std::io::Error> = None;
    for _ in 0..cfg.connect_attempts {
        match UnixStream::connect(&cfg.hub_socket).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                last = Some(err);
                tokio::time::sleep(cfg.retry_backoff).await;
            }
        }
    }
    Err(NodeError::Startup(format!(
        "hub socket {} unavailable: {}",
        cfg.hub_socket.display(),
        last.map(|e| e.to_string()).unwrap_or_default()
    )))
}

async fn handle_result(
    name: &str,
    result: Result<Vec<Output>, NodeError>,
    comm: &mut CommTracker,
    metrics: &NodeMetrics,
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
) -> Result<(), NodeError> {
    match result {
        Ok(outputs) => {
            comm.on_ok();
            for output in outputs {
                metrics.outputs_total.inc();
                let msg = Message::Publish {
                    topic: output.topic,
                    payload: output.payload,
                };
                write_message(write_half, &msg).await?;
            }
            Ok(())
        }
        Err(err) => {
            metrics.comm_errors_total.inc();
            match comm.on_error(Instant::now()) {
                CommVerdict::Tolerated => {
                    warn!(node = name, error = %err, "device io error");
                    Ok(())
                }
                CommVerdict::Degraded => {
                    warn!(
                        node = name,
                        consecutive = comm.consecutive(),
                        error = %err,
                        "node degraded"
                    );
                    Ok(())
                }
                CommVerdict::Fatal => Err(NodeError::Communication {
                    consecutive: comm.consecutive(),
                    last: err.to_string(),
                }),
            }
        }
    }
}

async fn read_loop(
    mut read_half: tokio::net::unix::OwnedReadHalf,
    tx: mpsc::Sender<Incoming>,
) {
    loop {
        match read_message(&mut read_half).await {
            Ok(Message::Data { topic, payload }) => {
                if tx.send(Incoming::Input { topic, payload }).await.is_err() {
                    return;
                }
            }
            Ok(Message::Stop) => {
                let _ = tx.send(Incoming::Stop).await;
                return;
            }
            Ok(_) => {}
            Err(_) => {
                let _ = tx.send(Incoming::Closed).await;
                return;
            }
        }
    }
}

async fn release(node: Box<dyn Node>, name: &str, deadline: Duration) {
    let handle = tokio::task::spawn_blocking(move || {
        let mut node = node;
        node.on_stop();
    });
    match tokio::time::timeout(deadline, handle).await {
        Ok(_) => {}
        Err(_) => {
            warn!(
                node = name,
                deadline_ms = deadline.as_millis() as u64,
                "device release exceeded the drain deadline"
            );
        }
    }
}
