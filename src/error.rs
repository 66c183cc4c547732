// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 错误类型: 每一层一个枚举

use std::path::PathBuf;

/// 视频源错误
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to open stream {address}: {reason}")]
    Open { address: String, reason: String },

    /// 单帧读取失败, 采集线程会重试
    #[error("frame read failed: {0}")]
    Read(String),

    #[error("stream closed")]
    Closed,
}

/// 采集流水线错误
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("no frame from {address} after {attempts} attempts")]
    NoFrame { address: String, attempts: u32 },

    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// 告警存储错误
#[derive(Debug, thiserror::Error)]
pub enum AlarmError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode alarm image: {0}")]
    Encode(#[from] image::ImageError),

    #[error("alarm image {0} missing after write")]
    NotWritten(PathBuf),

    #[error("invalid camera id {0:?}")]
    InvalidCamera(String),

    #[error("failed to serialize statistics: {0}")]
    Json(#[from] serde_json::Error),
}

impl AlarmError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// 控制接口错误
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("unknown camera {0}")]
    UnknownCamera(String),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("failed to start processing for camera {0}")]
    StartFailed(String),

    #[error(transparent)]
    Alarm(#[from] AlarmError),
}

/// 配置文件错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = ControlError> = std::result::Result<T, E>;
