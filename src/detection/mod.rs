/// 检测系统 (Detection System)
///
/// - InferenceEngine: 分割模型接口
/// - analysis:        是否有人 + 分割面积
/// - render:          标注画面
pub mod analysis;
pub mod render;
pub mod types;

#[cfg(feature = "onnx")]
pub mod onnx;

use image::RgbImage;

pub use analysis::{analyze, FrameAnalysis, PersonRegion};
pub use render::Renderer;
pub use types::{non_max_suppression, Bbox, DetectionResult, Instance, Mask, PERSON_CLASS};

#[cfg(feature = "onnx")]
pub use onnx::YoloSegEngine;

/// 分割模型推理接口, 多个推理线程共享同一实例
///
/// `Ok(None)` 和 `Err` 都按无检测处理。
pub trait InferenceEngine: Send + Sync {
    fn predict(&self, frame: &RgbImage) -> anyhow::Result<Option<DetectionResult>>;
}
