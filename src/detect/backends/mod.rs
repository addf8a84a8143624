mod anchor_head;
mod stub;
mod yolo;

#[cfg(feature = "backend-tract")]
mod tract;

pub use anchor_head::AnchorHeadBackend;
pub use stub::StubBackend;
pub use yolo::YoloBackend;

#[cfg(feature = "backend-tract")]
pub use tract::TractModel;
