#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Frame codec for the named-socket transport between nodes, the bridge
//! hub, and the controlling CLI.
//!
//! Every frame is a u32-LE length prefix followed by a tagged body. Payloads
//! are either an image or a named float vector; nothing deeper exists on
//! the bus.

pub mod client;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use telecap_core::types::{ImageFrame, JointVector};

/// Upper bound on a single frame; a 1080p RGB image is ~6 MiB.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame of {got} bytes exceeds limit {limit}")]
    FrameTooLarge { got: usize, limit: usize },
    #[error("truncated frame: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("unknown payload tag {0}")]
    UnknownPayloadTag(u8),
    #[error("topic is not utf-8")]
    BadTopic,
    #[error("image payload is {got} bytes, expected {want}")]
    BadImageLength { want: usize, got: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bus payloads: an image frame or a named numeric vector.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Image {
        width: u32,
        height: u32,
        bytes: Vec<u8>,
    },
    Vector {
        name: String,
        values: Vec<f32>,
    },
}

impl Payload {
    pub fn byte_len(&self) -> usize {
        match self {
            Payload::Image { bytes, .. } => bytes.len(),
            Payload::Vector { values, .. } => values.len() * 4,
        }
    }
}

pub trait ToWire<T> {
    fn to_wire(&self) -> T;
}

pub trait TryToCore<T> {
    type Error;
    fn try_to_core(&self) -> Result<T, Self::Error>;
}

impl ToWire<Payload> for ImageFrame {
    fn to_wire(&self) -> Payload {
        Payload::Image {
            width: self.width,
            height: self.height,
            bytes: self.rgb.clone(),
        }
    }
}

impl TryToCore<ImageFrame> for Payload {
    type Error = WireError;

    fn try_to_core(&self) -> Result<ImageFrame, WireError> {
        match self {
            Payload::Image {
                width,
                height,
                bytes,
            } => ImageFrame::new(*width, *height, bytes.clone()).map_err(|_| {
                WireError::BadImageLength {
                    want: (*width as usize) * (*height as usize) * 3,
                    got: bytes.len(),
                }
            }),
            Payload::Vector { .. } => Err(WireError::UnknownPayloadTag(PAYLOAD_VECTOR)),
        }
    }
}

impl ToWire<Payload> for JointVector {
    fn to_wire(&self) -> Payload {
        Payload::Vector {
            name: self.bus.0.clone(),
            values: self.values.clone(),
        }
    }
}

impl TryToCore<JointVector> for Payload {
    type Error = WireError;

    fn try_to_core(&self) -> Result<JointVector, WireError> {
        match self {
            Payload::Vector { name, values } => Ok(JointVector::new(name.clone(), values.clone())),
            Payload::Image { .. } => Err(WireError::UnknownPayloadTag(PAYLOAD_IMAGE)),
        }
    }
}

/// Everything that crosses a socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Node → hub: latest value for a topic.
    Publish { topic: String, payload: Payload },
    /// CLI → hub: read the latest value for a topic.
    Get { topic: String },
    /// CLI → hub: inject a value (action commands) into the graph.
    Put { topic: String, payload: Payload },
    /// Hub → CLI: reply carrying data.
    Data { topic: String, payload: Payload },
    /// Hub → CLI: reply when no data is available; never blocks the caller.
    Empty,
    /// Hub → CLI: acknowledgement for `Put`.
    Ok,
    /// Hub → node: drain and release devices.
    Stop,
    /// Node → hub: declare input topics; the hub pushes `Data` for each.
    Subscribe { topics: Vec<String> },
}

const MSG_PUBLISH: u8 = 1;
const MSG_GET: u8 = 2;
const MSG_PUT: u8 = 3;
const MSG_DATA: u8 = 4;
const MSG_EMPTY: u8 = 5;
const MSG_OK: u8 = 6;
const MSG_STOP: u8 = 7;
const MSG_SUBSCRIBE: u8 = 8;

const PAYLOAD_IMAGE: u8 = 1;
const PAYLOAD_VECTOR: u8 = 2;

fn put_topic(buf: &mut BytesMut, topic: &str) {
    buf.put_u16_le(topic.len().min(u16::MAX as usize) as u16);
    buf.put_slice(topic.as_bytes());
}

fn put_payload(buf: &mut BytesMut, payload: &Payload) {
    match payload {
        Payload::Image {
            width,
            height,
            bytes,
        } => {
            buf.put_u8(PAYLOAD_IMAGE);
            buf.put_u32_le(*width);
            buf.put_u32_le(*height);
            buf.put_u32_le(bytes.len() as u32);
            buf.put_slice(bytes);
        }
        Payload::Vector { name, values } => {
            buf.put_u8(PAYLOAD_VECTOR);
            put_topic(buf, name);
            buf.put_u32_le(values.len() as u32);
            for v in values {
                buf.put_f32_le(*v);
            }
        }
    }
}

pub fn encode(msg: &Message) -> BytesMut {
    let mut body = BytesMut::with_capacity(16 + msg_payload_len(msg));
    match msg {
        Message::Publish { topic, payload } => {
            body.put_u8(MSG_PUBLISH);
            put_topic(&mut body, topic);
            put_payload(&mut body, payload);
        }
        Message::Get { topic } => {
            body.put_u8(MSG_GET);
            put_topic(&mut body, topic);
        }
        Message::Put { topic, payload } => {
            body.put_u8(MSG_PUT);
            put_topic(&mut body, topic);
            put_payload(&mut body, payload);
        }
        Message::Data { topic, payload } => {
            body.put_u8(MSG_DATA);
            put_topic(&mut body, topic);
            put_payload(&mut body, payload);
        }
        Message::Empty => body.put_u8(MSG_EMPTY),
        Message::Ok => body.put_u8(MSG_OK),
        Message::Stop => body.put_u8(MSG_STOP),
        Message::Subscribe { topics } => {
            body.put_u8(MSG_SUBSCRIBE);
            body.put_u16_le(topics.len().min(u16::MAX as usize) as u16);
            for topic in topics {
                put_topic(&mut body, topic);
            }
        }
    }

    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32_le(body.len() as u32);
    frame.extend_from_slice(&body);
    frame
}

fn msg_payload_len(msg: &Message) -> usize {
    match msg {
        Message::Publish { payload, .. }
        | Message::Put { payload, .. }
        | Message::Data { payload, .. } => payload.byte_len() + 32,
        _ => 0,
    }
}

fn take_topic(buf: &mut &[u8]) -> Result<String, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::Truncated {
            needed: 2 - buf.remaining(),
        });
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated {
            needed: len - buf.remaining(),
        });
    }
    let raw = buf[..len].to_vec();
    buf.advance(len);
    String::from_utf8(raw).map_err(|_| WireError::BadTopic)
}

fn take_payload(buf: &mut &[u8]) -> Result<Payload, WireError> {
    if buf.remaining() < 1 {
        return Err(WireError::Truncated { needed: 1 });
    }
    match buf.get_u8() {
        PAYLOAD_IMAGE => {
            if buf.remaining() < 12 {
                return Err(WireError::Truncated {
                    needed: 12 - buf.remaining(),
                });
            }
            let width = buf.get_u32_le();
            let height = buf.get_u32_le();
            let len = buf.get_u32_le() as usize;
            if buf.remaining() < len {
                return Err(WireError::Truncated {
                    needed: len - buf.remaining(),
                });
            }
            let bytes = buf[..len].to_vec();
            buf.advance(len);
            Ok(Payload::Image {
                width,
                height,
                bytes,
            })
        }
        PAYLOAD_VECTOR => {
            let name = take_topic(buf)?;
            if buf.remaining() < 4 {
                return Err(WireError::Truncated {
                    needed: 4 - buf.remaining(),
                });
            }
            let count = buf.get_u32_le() as usize;
            if buf.remaining() < count * 4 {
                return Err(WireError::Truncated {
                    needed: count * 4 - buf.remaining(),
                });
            }
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(buf.get_f32_le());
            }
            Ok(Payload::Vector { name, values })
        }
        other => Err(WireError::UnknownPayloadTag(other)),
    }
}

pub fn decode(body: &[u8]) -> Result<Message, WireError> {
    let mut buf = body;
    if buf.remaining() < 1 {
        return Err(WireError::Truncated { needed: 1 });
    }
    match buf.get_u8() {
        MSG_PUBLISH => {
            let topic = take_topic(&mut buf)?;
            let payload = take_payload(&mut buf)?;
            Ok(Message::Publish { topic, payload })
        }
        MSG_GET => Ok(Message::Get {
            topic: take_topic(&mut buf)?,
        }),
        MSG_PUT => {
            let topic = take_topic(&mut buf)?;
            let payload = take_payload(&mut buf)?;
            Ok(Message::Put { topic, payload })
        }
        MSG_DATA => {
            let topic = take_topic(&mut buf)?;
            let payload = take_payload(&mut buf)?;
            Ok(Message::Data { topic, payload })
        }
        MSG_EMPTY => Ok(Message::Empty),
        MSG_OK => Ok(Message::Ok),
        MSG_STOP => Ok(Message::Stop),
        MSG_SUBSCRIBE => {
            if buf.remaining() < 2 {
                return Err(WireError::Truncated {
                    needed: 2 - buf.remaining(),
                });
            }
            let count = buf.get_u16_le() as usize;
            let mut topics = Vec::with_capacity(count);
            for _ in 0..count {
                topics.push(take_topic(&mut buf)?);
            }
            Ok(Message::Subscribe { topics })
        }
        other => Err(WireError::UnknownTag(other)),
    }
}

pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), WireError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let frame = encode(msg);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_message<R>(reader: &mut R) -> Result<Message, WireError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let len = reader.read_u32_le().await? as usize;
    if len > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge {
            got: len,
            limit: MAX_FRAME_BYTES,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode(&body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let frame = encode(&msg);
        // Skip the length prefix the async reader would consume.
        let decoded = decode(&frame[4..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn roundtrip_all_variants() {
        roundtrip(Message::Publish {
            topic: "joint/leader".to_string(),
            payload: Payload::Vector {
                name: "leader".to_string(),
                values: vec![0.0, -1.5, 3.25],
            },
        });
        roundtrip(Message::Get {
            topic: "image/top".to_string(),
        });
        roundtrip(Message::Put {
            topic: "action/command".to_string(),
            payload: Payload::Vector {
                name: "cli".to_string(),
                values: vec![1.0; 7],
            },
        });
        roundtrip(Message::Data {
            topic: "image/top".to_string(),
            payload: Payload::Image {
                width: 2,
                height: 2,
                bytes: vec![7u8; 12],
            },
        });
        roundtrip(Message::Empty);
        roundtrip(Message::Ok);
        roundtrip(Message::Stop);
        roundtrip(Message::Subscribe {
            topics: vec!["joint/leader".to_string(), "joint/follower".to_string()],
        });
    }

    #[test]
    fn truncated_image_is_rejected() {
        let msg = Message::Data {
            topic: "image/top".to_string(),
            payload: Payload::Image {
                width: 4,
                height: 4,
                bytes: vec![0u8; 48],
            },
        };
        let frame = encode(&msg);
        let err = decode(&frame[4..frame.len() - 8]).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = decode(&[99]).unwrap_err();
        assert!(matches!(err, WireError::UnknownTag(99)));
    }

    #[test]
    fn image_payload_converts_to_core_frame() {
        let payload = Payload::Image {
            width: 2,
            height: 1,
            bytes: vec![1u8; 6],
        };
        let frame: ImageFrame = payload.try_to_core().unwrap();
        assert_eq!(frame.width, 2);
        assert_eq!(frame.byte_len(), 6);

        let bad = Payload::Image {
            width: 2,
            height: 1,
            bytes: vec![1u8; 5],
        };
        assert!(TryToCore::<ImageFrame>::try_to_core(&bad).is_err());
    }

    #[tokio::test]
    async fn async_read_write_roundtrip() -> anyhow::Result<()> {
        let (mut a, mut b) = tokio::io::duplex(1024 * 1024);
        let msg = Message::Publish {
            topic: "joint/follower".to_string(),
            payload: Payload::Vector {
                name: "follower".to_string(),
                values: vec![0.5; 7],
            },
        };
        write_message(&mut a, &msg).await?;
        let got = read_message(&mut b).await?;
        assert_eq!(got, msg);
        Ok(())
    }
}
