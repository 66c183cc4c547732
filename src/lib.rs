// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod alarm; // 告警生命周期管理
pub mod area; // 跨摄像头面积统计
pub mod capture; // 采集 + 推理流水线
pub mod config; // 系统配置
pub mod detection; // 分割模型接口、分析与渲染
pub mod error; // 错误类型
pub mod orchestrator; // 系统编排
pub mod source; // 视频输入

pub use crate::alarm::{Alarm, AlarmManager, AlarmState, AlarmStatistics};
pub use crate::area::{AreaAggregator, AreaStats};
pub use crate::capture::{
    CameraStatus, CameraView, CancelToken, CapturePipeline, FrameKind, PerformanceStats,
    PipelineEvent,
};
pub use crate::config::{AppConfig, CameraConfig, RenderMode};
pub use crate::detection::{DetectionResult, InferenceEngine};
pub use crate::orchestrator::Orchestrator;
pub use crate::source::{Connector, FrameSource};

/// 初始化日志, RUST_LOG 可覆盖默认级别
pub fn init_logging(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}
