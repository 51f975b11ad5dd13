use telecap_core::topic;
use telecap_core::types::CameraName;
use telecap_wire::{Payload, ToWire};

use crate::adapter::Camera;
use crate::runtime::{Node, Output};
use crate::NodeError;

/// Captures one frame per tick and publishes it on `image/<cam>`.
pub struct CameraNode {
    node_name: String,
    cam: CameraName,
    camera: Box<dyn Camera>,
}

impl CameraNode {
    pub fn new(cam: CameraName, camera: Box<dyn Camera>) -> Self {
        Self {
            node_name: format!("camera-{}", cam.0),
            cam,
            camera,
        }
    }
}

impl Node for CameraNode {
    fn name(&self) -> &str {
        &self.node_name
    }

    fn on_start(&mut self) -> Result<(), NodeError> {
        self.camera.open()
    }

    fn on_tick(&mut self) -> Result<Vec<Output>, NodeError> {
        let frame = self.camera.capture()?;
        Ok(vec![Output::new(
            topic::image(&self.cam),
            ToWire::<Payload>::to_wire(&frame),
        )])
    }

    fn on_input(&mut self, _topic: &str, _payload: &Payload) -> Result<Vec<Output>, NodeError> {
        Ok(Vec::new())
    }

    fn on_stop(&mut self) {
        self.camera.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::SimCamera;

    #[test]
    fn publishes_one_image_per_tick() {
        let cam = CameraName("top".to_string());
        let mut node = CameraNode::new(cam, Box::new(SimCamera::new("top", 4, 4)));
        node.on_start().unwrap();
        let outputs = node.on_tick().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].topic, "image/top");
        match &outputs[0].payload {
            Payload::Image { width, height, bytes } => {
                assert_eq!((*width, *height), (4, 4));
                assert_eq!(bytes.len(), 48);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        node.on_stop();
    }

    #[test]
    fn capture_failure_is_a_device_error() {
        let cam = CameraName("top".to_string());
        let mut node = CameraNode::new(cam, Box::new(SimCamera::new("top", 4, 4)));
        // Never opened: capture must fail, not panic.
        assert!(node.on_tick().is_err());
    }
}
