/// FFmpeg RTSP 拉流
/// FFmpeg RTSP source: decode filter + scheduler handle
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::core::scheduler::ffmpeg_scheduler::{FfmpegScheduler, Running};
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Frame, Input};
use image::RgbImage;
use std::time::Duration;

use super::{Connector, FrameSource};
use crate::config::StreamParams;
use crate::error::SourceError;

/// 解码过滤器: YUV420P → RGB, 只保留最新的 N 帧
struct DecodeFilter {
    tx: Sender<RgbImage>,
    rx: Receiver<RgbImage>,
    count: u64,
}

impl FrameFilter for DecodeFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        tracing::debug!("解码过滤器启动");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<Frame>, String> {
        let Some(rgb) = yuv420p_to_rgb(&frame) else {
            return Ok(Some(frame));
        };
        self.count += 1;

        // 缓冲已满时丢弃最旧的一帧
        if let Err(TrySendError::Full(rgb)) = self.tx.try_send(rgb) {
            let _ = self.rx.try_recv();
            let _ = self.tx.try_send(rgb);
        }
        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        tracing::debug!(frames = self.count, "解码过滤器退出");
    }
}

/// YUV420P → RGB (BT.601)
fn yuv420p_to_rgb(frame: &Frame) -> Option<RgbImage> {
    unsafe {
        let raw = frame.as_ptr();
        if raw.is_null() {
            return None;
        }
        let w = (*raw).width.max(0) as usize;
        let h = (*raw).height.max(0) as usize;
        let data_y = (*raw).data[0];
        let data_u = (*raw).data[1];
        let data_v = (*raw).data[2];
        if w == 0 || h == 0 || data_y.is_null() || data_u.is_null() || data_v.is_null() {
            return None;
        }
        let y_stride = (*raw).linesize[0] as usize;
        let uv_stride = (*raw).linesize[1] as usize;

        let mut rgb = vec![0u8; w * h * 3];
        for y in 0..h {
            for x in 0..w {
                let y_val = *data_y.add(y * y_stride + x) as f32;
                let u_val = *data_u.add((y / 2) * uv_stride + x / 2) as f32 - 128.0;
                let v_val = *data_v.add((y / 2) * uv_stride + x / 2) as f32 - 128.0;

                let idx = (y * w + x) * 3;
                rgb[idx] = (y_val + 1.402 * v_val).clamp(0.0, 255.0) as u8;
                rgb[idx + 1] = (y_val - 0.344 * u_val - 0.714 * v_val).clamp(0.0, 255.0) as u8;
                rgb[idx + 2] = (y_val + 1.772 * u_val).clamp(0.0, 255.0) as u8;
            }
        }
        RgbImage::from_raw(w as u32, h as u32, rgb)
    }
}

/// 一路 RTSP 连接
pub struct FfmpegSource {
    rx: Receiver<RgbImage>,
    scheduler: Option<FfmpegScheduler<Running>>,
    read_timeout: Duration,
}

impl FrameSource for FfmpegSource {
    fn read(&mut self) -> Result<RgbImage, SourceError> {
        if self.scheduler.is_none() {
            return Err(SourceError::Closed);
        }
        match self.rx.recv_timeout(self.read_timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(SourceError::Read("read timeout".into())),
            Err(RecvTimeoutError::Disconnected) => Err(SourceError::Closed),
        }
    }

    fn release(&mut self) {
        if let Some(sch) = self.scheduler.take() {
            sch.abort();
            tracing::debug!("RTSP 连接已释放");
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.release();
    }
}

/// 软件解码的 RTSP 连接器 (TCP 传输)
#[derive(Debug, Default, Clone)]
pub struct FfmpegConnector;

impl Connector for FfmpegConnector {
    fn open(
        &self,
        address: &str,
        params: &StreamParams,
    ) -> Result<Box<dyn FrameSource>, SourceError> {
        let open_err = |reason: String| SourceError::Open {
            address: address.to_string(),
            reason,
        };

        let (tx, rx) = crossbeam_channel::bounded(params.buffer_size.max(1) as usize);
        let filter = DecodeFilter {
            tx,
            rx: rx.clone(),
            count: 0,
        };

        let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
        let pipe = pipe.filter("decode", Box::new(filter));
        let out = create_null_output().add_frame_pipeline(pipe);

        // 超时单位: 微秒
        let timeout_us = (params.open_timeout_ms * 1000).to_string();
        let input = Input::new(address).set_input_opts(
            [
                ("rtsp_transport", "tcp"),
                ("rtsp_flags", "prefer_tcp"),
                ("timeout", timeout_us.as_str()),
                ("fflags", "nobuffer"),
            ]
            .into(),
        );

        let filter_desc = format!(
            "fps={},scale={}:{},format=yuv420p",
            params.fps, params.width, params.height
        );
        let ctx = FfmpegContext::builder()
            .input(input)
            .filter_desc(filter_desc)
            .output(out)
            .build()
            .map_err(|e| open_err(format!("build failed: {e}")))?;

        let sch = ctx
            .start()
            .map_err(|e| open_err(format!("start failed: {e}")))?;
        tracing::info!(%address, fps = params.fps, width = params.width, height = params.height, "RTSP 拉流启动");

        Ok(Box::new(FfmpegSource {
            rx,
            scheduler: Some(sch),
            read_timeout: params.read_timeout(),
        }))
    }
}
