//! Bridge hub: the rendezvous point between the dataflow nodes and the
//! controlling CLI.
//!
//! Topics have single-slot "latest" semantics: a new publish overwrites the
//! old value. Subscribed nodes get pushes; the CLI pulls over the two
//! request/reply sockets and always gets an answer (`Data` or `Empty`)
//! immediately, so the caller never blocks past its own deadline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use telecap_wire::client::SocketPaths;
use telecap_wire::{read_message, write_message, Message, Payload};

use crate::NodeError;

#[derive(Default)]
struct TopicStore {
    slots: Mutex<HashMap<String, watch::Sender<Option<Payload>>>>,
}

impl TopicStore {
    fn slot(&self, topic: &str) -> watch::Sender<Option<Payload>> {
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots
            .entry(topic.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }

    fn publish(&self, topic: &str, payload: Payload) {
        self.slot(topic).send_replace(Some(payload));
    }

    fn latest(&self, topic: &str) -> Option<Payload> {
        let slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.get(topic).and_then(|tx| tx.borrow().clone())
    }
}

/// Runs the hub until cancellation. Socket files are (re)created here; the
/// supervisor removes stale ones before the graph starts.
pub async fn run_hub(paths: SocketPaths, cancel: CancellationToken) -> Result<(), NodeError> {
    std::fs::create_dir_all(&paths.runtime_dir)?;
    for path in paths.all() {
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
    }

    let hub_listener = UnixListener::bind(paths.hub())?;
    let frames_listener = UnixListener::bind(paths.frames())?;
    let joints_listener = UnixListener::bind(paths.joints())?;
    info!(
        target: "telecap_proof",
        event = "hub_ready",
        runtime_dir = %paths.runtime_dir.display(),
        "bridge hub listening"
    );

    let store = Arc::new(TopicStore::default());

    let hub_task = tokio::spawn(accept_loop(
        hub_listener,
        store.clone(),
        cancel.clone(),
        ConnKind::Node,
    ));
    let frames_task = tokio::spawn(accept_loop(
        frames_listener,
        store.clone(),
        cancel.clone(),
        ConnKind::Reply,
    ));
    let joints_task = tokio::spawn(accept_loop(
        joints_listener,
        store.clone(),
        cancel.clone(),
        ConnKind::Reply,
    ));

    cancel.cancelled().await;
    let _ = hub_task.await;
    let _ = frames_task.await;
    let _ = joints_task.await;

    for path in paths.all() {
        let _ = std::fs::remove_file(path);
    }
    info!(target: "telecap_proof", event = "hub_stopped", "bridge hub stopped");
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum ConnKind {
    Node,
    Reply,
}

async fn accept_loop(
    listener: UnixListener,
    store: Arc<TopicStore>,
    cancel: CancellationToken,
    kind: ConnKind,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let store = store.clone();
                        let cancel = cancel.clone();
                        match kind {
                            ConnKind::Node => { tokio::spawn(node_conn(stream, store, cancel)); }
                            ConnKind::Reply => { tokio::spawn(reply_conn(stream, store, cancel)); }
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        return;
                    }
                }
            }
        }
    }
}

/// One connected dataflow node: publishes into the store and receives
/// pushed inputs for its subscriptions. On cancellation the hub sends one
/// `Stop` frame so the node can drain and release its devices.
async fn node_conn(stream: UnixStream, store: Arc<TopicStore>, cancel: CancellationToken) {
    let (mut read_half, write_half) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(write_half));
    let mut forwarders: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let mut guard = writer.lock().await;
                let _ = write_message(&mut *guard, &Message::Stop).await;
                break;
            }
            msg = read_message(&mut read_half) => {
                match msg {
                    Ok(Message::Publish { topic, payload }) => {
                        store.publish(&topic, payload);
                    }
                    Ok(Message::Subscribe { topics }) => {
                        debug!(topics = ?topics, "node subscribed");
                        for topic in topics {
                            let rx = store.slot(&topic).subscribe();
                            forwarders.push(tokio::spawn(forward_topic(
                                topic,
                                rx,
                                writer.clone(),
                            )));
                        }
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }

    for task in forwarders {
        task.abort();
    }
}

async fn forward_topic(
    topic: String,
    mut rx: watch::Receiver<Option<Payload>>,
    writer: Arc<tokio::sync::Mutex<tokio::net::unix::OwnedWriteHalf>>,
) {
    // Deliver the current latest first so late subscribers (the teleop
    // mapper waiting for a follower reading) do not miss it.
    let initial = rx.borrow_and_update().clone();
    if let Some(payload) = initial {
        let msg = Message::Data {
            topic: topic.clone(),
            payload,
        };
        let mut guard = writer.lock().await;
        if write_message(&mut *guard, &msg).await.is_err() {
            return;
        }
    }

    loop {
        if rx.changed().await.is_err() {
            return;
        }
        let latest = rx.borrow_and_update().clone();
        if let Some(payload) = latest {
            let msg = Message::Data {
                topic: topic.clone(),
                payload,
            };
            let mut guard = writer.lock().await;
            if write_message(&mut *guard, &msg).await.is_err() {
                return;
            }
        }
    }
}

/// One CLI request/reply connection.
async fn reply_conn(stream: UnixStream, store: Arc<TopicStore>, cancel: CancellationToken) {
    let mut stream = stream;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            msg = read_message(&mut stream) => {
                let reply = match msg {
                    Ok(Message::Get { topic }) => match store.latest(&topic) {
                        Some(payload) => Message::Data { topic, payload },
                        None => Message::Empty,
                    },
                    Ok(Message::Put { topic, payload }) => {
                        store.publish(&topic, payload);
                        Message::Ok
                    }
                    Ok(_) => Message::Empty,
                    Err(_) => return,
                };
                if write_message(&mut stream, &reply).await.is_err() {
                    return;
                }
            }
        }
    }
}
