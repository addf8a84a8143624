//! Object detection: backends, the anchor-head decoder and result types.

mod backend;
mod backends;
mod decode;
mod registry;
mod result;
mod tensor;
mod yolo;

pub use backend::{DetectorBackend, TensorModel};
pub use backends::{AnchorHeadBackend, StubBackend, YoloBackend};
pub use decode::{AnchorSet, DecodeError, DecodeOptions, DetectionDecoder, RawDetectionTensors, ScaleTensors};
pub use registry::BackendRegistry;
pub use result::{BoxEncoding, Detection, DetectionResult};
pub use tensor::TensorData;
pub use yolo::{decode_yolo_head, iou, non_max_suppression, YoloDecodeOptions};

#[cfg(feature = "backend-tract")]
pub use backends::TractModel;
