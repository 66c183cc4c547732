/// 视频输入 (Frame Source)
///
/// 一个 `FrameSource` 独占一路实时流连接, 由采集线程持有;
/// `Connector` 负责按地址打开新连接。
#[cfg(feature = "rtsp")]
pub mod ffmpeg;

use image::RgbImage;

use crate::config::StreamParams;
use crate::error::SourceError;

#[cfg(feature = "rtsp")]
pub use ffmpeg::FfmpegConnector;

pub trait FrameSource: Send {
    /// 读取一帧, 失败由调用方决定是否重试
    fn read(&mut self) -> Result<RgbImage, SourceError>;

    /// 释放连接, 可重复调用
    fn release(&mut self);
}

pub trait Connector: Send + Sync {
    fn open(
        &self,
        address: &str,
        params: &StreamParams,
    ) -> Result<Box<dyn FrameSource>, SourceError>;
}
