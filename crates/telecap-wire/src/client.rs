use std::path::PathBuf;
use std::time::Duration;

use tokio::net::UnixStream;

use telecap_core::types::{CameraName, ImageFrame, JointVector};

use crate::{read_message, write_message, Message, Payload, ToWire, TryToCore, WireError};

/// Fixed socket locations under one runtime directory. The lifecycle
/// supervisor deletes stale files here before the graph starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketPaths {
    pub runtime_dir: PathBuf,
}

impl SocketPaths {
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
        }
    }

    pub fn default_runtime() -> Self {
        Self::new("/tmp/telecap")
    }

    /// Node pub/sub + control socket.
    pub fn hub(&self) -> PathBuf {
        self.runtime_dir.join("hub.sock")
    }

    /// CLI request/reply socket for image frames.
    pub fn frames(&self) -> PathBuf {
        self.runtime_dir.join("frames.sock")
    }

    /// CLI request/reply socket for joint vectors and action injection.
    pub fn joints(&self) -> PathBuf {
        self.runtime_dir.join("joints.sock")
    }

    pub fn all(&self) -> [PathBuf; 3] {
        [self.hub(), self.frames(), self.joints()]
    }
}

/// Per-request deadline on the CLI side. Absence of data is the normal pull
/// idle signal, so an elapsed deadline is silent.
pub const REQUEST_DEADLINE: Duration = Duration::from_millis(100);

/// Lazy request/reply client for the bridge sockets.
///
/// Nothing is bound until [`BridgeClient::connect`]; after
/// [`BridgeClient::disconnect`] the streams are dropped immediately with no
/// lingering writes.
#[derive(Debug)]
pub struct BridgeClient {
    paths: SocketPaths,
    frames: Option<UnixStream>,
    joints: Option<UnixStream>,
}

impl BridgeClient {
    pub fn new(paths: SocketPaths) -> Self {
        Self {
            paths,
            frames: None,
            joints: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.frames.is_some() && self.joints.is_some()
    }

    pub async fn connect(&mut self) -> Result<(), WireError> {
        if self.frames.is_none() {
            self.frames = Some(UnixStream::connect(self.paths.frames()).await?);
        }
        if self.joints.is_none() {
            self.joints = Some(UnixStream::connect(self.paths.joints()).await?);
        }
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.frames = None;
        self.joints = None;
    }

    pub async fn latest_image(
        &mut self,
        cam: &CameraName,
        deadline: Duration,
    ) -> Result<Option<ImageFrame>, WireError> {
        let topic = telecap_core::topic::image(cam);
        match self.request(Channel::Frames, Message::Get { topic }, deadline).await? {
            Some(Message::Data { payload, .. }) => Ok(Some(payload.try_to_core()?)),
            _ => Ok(None),
        }
    }

    pub async fn latest_vector(
        &mut self,
        topic: &str,
        deadline: Duration,
    ) -> Result<Option<JointVector>, WireError> {
        let msg = Message::Get {
            topic: topic.to_string(),
        };
        match self.request(Channel::Joints, msg, deadline).await? {
            Some(Message::Data { payload, .. }) => Ok(Some(payload.try_to_core()?)),
            _ => Ok(None),
        }
    }

    /// Re-injects an action command into the graph (control mode).
    pub async fn send_action(
        &mut self,
        action: &JointVector,
        deadline: Duration,
    ) -> Result<bool, WireError> {
        let msg = Message::Put {
            topic: telecap_core::topic::ACTION_COMMAND.to_string(),
            payload: ToWire::<Payload>::to_wire(action),
        };
        Ok(matches!(
            self.request(Channel::Joints, msg, deadline).await?,
            Some(Message::Ok)
        ))
    }

    async fn request(
        &mut self,
        channel: Channel,
        msg: Message,
        deadline: Duration,
    ) -> Result<Option<Message>, WireError> {
        let stream = match channel {
            Channel::Frames => self.frames.as_mut(),
            Channel::Joints => self.joints.as_mut(),
        };
        let Some(stream) = stream else {
            return Ok(None);
        };

        let exchange = async {
            write_message(stream, &msg).await?;
            read_message(stream).await
        };
        match tokio::time::timeout(deadline, exchange).await {
            Ok(Ok(reply)) => Ok(Some(reply)),
            Ok(Err(err)) => {
                // A broken stream means the bridge went away; drop it so the
                // caller keeps ticking and a later connect() can recover.
                tracing::debug!(error = %err, "bridge request failed, dropping stream");
                match channel {
                    Channel::Frames => self.frames = None,
                    Channel::Joints => self.joints = None,
                }
                Ok(None)
            }
            // Elapsed deadline is the idle signal; no log spam.
            Err(_) => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Channel {
    Frames,
    Joints,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_paths_share_the_runtime_dir() {
        let paths = SocketPaths::new("/tmp/telecap-test");
        assert_eq!(paths.hub(), PathBuf::from("/tmp/telecap-test/hub.sock"));
        assert_eq!(paths.frames(), PathBuf::from("/tmp/telecap-test/frames.sock"));
        assert_eq!(paths.joints(), PathBuf::from("/tmp/telecap-test/joints.sock"));
    }

    #[tokio::test]
    async fn disconnected_client_returns_none_without_blocking() -> anyhow::Result<()> {
        let mut client = BridgeClient::new(SocketPaths::new("/tmp/telecap-nonexistent"));
        let cam = CameraName("top".to_string());
        let got = client.latest_image(&cam, REQUEST_DEADLINE).await?;
        assert!(got.is_none());
        assert!(!client.is_connected());
        Ok(())
    }
}
