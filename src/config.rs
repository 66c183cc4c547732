// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
//! 系统配置 - 通过JSON文件调整参数

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// 标注渲染模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    /// 仅分割掩码
    Segmentation,
    /// 分割掩码 + 检测框与置信度标签
    Detection,
}

/// 单个摄像头
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: String,
    #[serde(default)]
    pub address: Option<String>,
    pub render_mode: RenderMode,
}

/// 拉流参数 (连接时固定)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamParams {
    pub buffer_size: u32,      // 缓冲帧数
    pub fps: u32,              // 目标帧率
    pub width: u32,            // 输出宽度
    pub height: u32,           // 输出高度
    pub fourcc: String,        // 编码格式
    pub open_timeout_ms: u64,  // 打开超时
    pub read_timeout_ms: u64,  // 读帧超时
    pub max_attempts: u32,     // 连接探测次数
    pub probe_interval_ms: u64, // 探测间隔
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            buffer_size: 1,
            fps: 15,
            width: 640,
            height: 480,
            fourcc: "H264".to_string(),
            open_timeout_ms: 10_000,
            read_timeout_ms: 5_000,
            max_attempts: 5,
            probe_interval_ms: 1_000,
        }
    }
}

impl StreamParams {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

/// 采集与推理流水线参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub frame_skip: u64,          // 每K帧送一次推理
    pub queue_size: usize,        // 推理队列容量
    pub ring_capacity: usize,     // 环形缓冲帧数
    pub jpeg_quality: u8,         // 实时画面JPEG质量
    pub capture_interval_ms: u64, // 采集循环间隔
    pub read_backoff_ms: u64,     // 读帧失败退避
    pub queue_timeout_ms: u64,    // 推理等待队列超时
    pub join_timeout_ms: u64,     // 停止时等待线程
    pub fps_window: u64,          // 每N帧刷新一次FPS
    pub log_interval: u64,        // 每N帧打印一次性能
    pub mask_threshold: f32,      // 掩码占用概率阈值
    pub event_capacity: usize,    // 事件通道容量
    pub font_path: Option<PathBuf>, // 标签字体, 缺省用内置字体
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            frame_skip: 2,
            queue_size: 5,
            ring_capacity: 2,
            jpeg_quality: 70,
            capture_interval_ms: 10,
            read_backoff_ms: 10,
            queue_timeout_ms: 1_000,
            join_timeout_ms: 3_000,
            fps_window: 30,
            log_interval: 1_000,
            mask_threshold: 0.5,
            event_capacity: 64,
            font_path: None,
        }
    }
}

impl ProcessingConfig {
    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms)
    }

    pub fn read_backoff(&self) -> Duration {
        Duration::from_millis(self.read_backoff_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// 告警存储参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    pub dir: PathBuf,
    pub cooldown_secs: f64,
    pub max_pending: usize,
    pub max_per_category: usize,
    pub jpeg_quality: u8,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("alarms"),
            cooldown_secs: 5.0,
            max_pending: 100,
            max_per_category: 100,
            jpeg_quality: 95,
        }
    }
}

impl AlarmConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_secs.max(0.0))
    }
}

/// 分割模型参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub conf: f32,
    pub iou: f32,
    pub cuda: bool,
    pub device_id: i32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("models/yolov8n-seg.onnx"),
            width: 640,
            height: 640,
            conf: 0.25,
            iou: 0.45,
            cuda: false,
            device_id: 0,
        }
    }
}

/// 完整配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cameras: Vec<CameraConfig>,
    pub stream: StreamParams,
    pub processing: ProcessingConfig,
    pub alarms: AlarmConfig,
    pub model: ModelConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cameras: vec![
                CameraConfig {
                    id: "camera1".to_string(),
                    address: None,
                    render_mode: RenderMode::Segmentation,
                },
                CameraConfig {
                    id: "camera2".to_string(),
                    address: None,
                    render_mode: RenderMode::Detection,
                },
            ],
            stream: StreamParams::default(),
            processing: ProcessingConfig::default(),
            alarms: AlarmConfig::default(),
            model: ModelConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从JSON文件加载配置; 文件不存在时写入默认配置, 解析失败时回退默认值
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(json) => match Self::from_json(&json) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "配置已加载");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "配置文件解析失败, 使用默认值");
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "配置文件不存在, 创建默认配置");
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    tracing::warn!(error = %e, "保存默认配置失败");
                }
                config
            }
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "配置已保存");
        Ok(())
    }

    pub fn camera(&self, id: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.id == id)
    }

    pub fn camera_ids(&self) -> Vec<String> {
        self.cameras.iter().map(|c| c.id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_deployment() {
        let config = AppConfig::default();
        assert_eq!(config.camera_ids(), vec!["camera1", "camera2"]);
        assert_eq!(config.camera("camera1").map(|c| c.render_mode), Some(RenderMode::Segmentation));
        assert_eq!(config.camera("camera2").map(|c| c.render_mode), Some(RenderMode::Detection));
        assert_eq!(config.stream.max_attempts, 5);
        assert_eq!(config.processing.frame_skip, 2);
        assert_eq!(config.processing.queue_size, 5);
        assert_eq!(config.alarms.cooldown(), Duration::from_secs(5));
        assert_eq!(config.alarms.max_pending, 100);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = AppConfig::from_json(r#"{"alarms": {"cooldown_secs": 2.5}}"#).unwrap();
        assert_eq!(config.alarms.cooldown(), Duration::from_millis(2500));
        assert_eq!(config.alarms.max_per_category, 100);
        assert_eq!(config.cameras.len(), 2);
    }

    #[test]
    fn test_load_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.json");
        let config = AppConfig::load(&path);
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());
        assert_eq!(AppConfig::load(&path), config);
    }

    #[test]
    fn test_load_falls_back_on_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(AppConfig::load(&path), AppConfig::default());
    }
}
