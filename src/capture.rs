// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 单摄像头采集 + 推理流水线
//
// 采集线程 ──(有界队列, 满则丢帧)──▶ 推理线程 ──▶ PipelineEvent

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use fast_image_resize as fr;
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, RgbImage};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::config::{AppConfig, ProcessingConfig, RenderMode, StreamParams};
use crate::detection::{analyze, InferenceEngine, Renderer};
use crate::error::CaptureError;
use crate::source::{Connector, FrameSource};

/// 协作式取消标志
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 流水线向外发送的事件
#[derive(Clone, Debug)]
pub enum PipelineEvent {
    /// 画面中有人, 附带标注帧
    PersonDetected {
        camera_id: String,
        frame: Arc<RgbImage>,
    },
    /// 每个推理帧的分割面积, 包括 0; session 标识产生它的那次启动
    AreaSample {
        camera_id: String,
        session: u64,
        area: u64,
    },
}

/// 采集线程 → 推理线程
struct FrameTask {
    frame: Arc<RgbImage>,
    seq: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Raw,
    Annotated,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CameraStatus {
    pub camera_id: String,
    pub connected: bool,
    pub processing: bool,
    pub segmentation_area: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub camera_id: String,
    pub captured_frames: u64,
    pub processed_frames: u64,
    pub dropped_frames: u64,
    pub fps: f64,
    pub queue_size: usize,
    pub is_running: bool,
    pub segmentation_area: u64,
    pub avg_segmentation_area: f64,
    pub frames_with_segmentation: u64,
}

#[derive(Default)]
struct CameraState {
    latest_raw: Option<Arc<RgbImage>>,
    latest_annotated: Option<Arc<RgbImage>>,
    ring: VecDeque<Arc<RgbImage>>,
    frame_counter: u64,
    processing: bool,
    connected: bool,
    area: u64,
    processed: u64,
    dropped: u64,
    fps: f64,
    area_sum: f64,
    frames_with_segmentation: u64,
    queue: Option<Receiver<FrameTask>>,
}

struct CameraShared {
    camera_id: String,
    state: Mutex<CameraState>,
}

impl CameraShared {
    fn lock(&self) -> MutexGuard<'_, CameraState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 只读视图, 不经过流水线锁即可读取实时状态
#[derive(Clone)]
pub struct CameraView {
    shared: Arc<CameraShared>,
}

impl CameraView {
    pub fn camera_id(&self) -> &str {
        &self.shared.camera_id
    }

    pub fn status(&self) -> CameraStatus {
        let state = self.shared.lock();
        CameraStatus {
            camera_id: self.shared.camera_id.clone(),
            connected: state.connected,
            processing: state.processing,
            segmentation_area: state.area,
        }
    }

    pub fn performance(&self) -> PerformanceStats {
        let state = self.shared.lock();
        let avg = if state.frames_with_segmentation > 0 {
            state.area_sum / state.frames_with_segmentation as f64
        } else {
            0.0
        };
        PerformanceStats {
            camera_id: self.shared.camera_id.clone(),
            captured_frames: state.frame_counter,
            processed_frames: state.processed,
            dropped_frames: state.dropped,
            fps: (state.fps * 10.0).round() / 10.0,
            queue_size: state.queue.as_ref().map(|q| q.len()).unwrap_or(0),
            is_running: state.processing,
            segmentation_area: state.area,
            avg_segmentation_area: (avg * 10.0).round() / 10.0,
            frames_with_segmentation: state.frames_with_segmentation,
        }
    }

    pub fn segmentation_area(&self) -> u64 {
        self.shared.lock().area
    }

    pub fn latest_frame(&self, kind: FrameKind) -> Option<Arc<RgbImage>> {
        let state = self.shared.lock();
        match kind {
            FrameKind::Raw => state.latest_raw.clone(),
            FrameKind::Annotated => state.latest_annotated.clone(),
        }
    }

    /// 最近的帧 (新到旧)
    pub fn recent_frames(&self) -> Vec<Arc<RgbImage>> {
        self.shared.lock().ring.iter().cloned().collect()
    }

    /// 编码为 JPEG, 编码在锁外进行
    pub fn latest_jpeg(&self, kind: FrameKind, quality: u8) -> Option<Vec<u8>> {
        let frame = self.latest_frame(kind)?;
        encode_jpeg(&frame, quality)
            .map_err(|e| tracing::warn!(camera_id = %self.shared.camera_id, error = %e, "JPEG 编码失败"))
            .ok()
    }
}

pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)).encode_image(frame)?;
    Ok(buf)
}

struct Worker {
    name: String,
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

struct Workers {
    cancel: CancelToken,
    threads: Vec<Worker>,
}

/// 工作线程退出时 done 通道断开, 用于限时 join
fn spawn_worker<F>(name: String, body: F) -> std::io::Result<Worker>
where
    F: FnOnce() + Send + 'static,
{
    let (done_tx, done) = crossbeam_channel::bounded::<()>(1);
    let handle = thread::Builder::new().name(name.clone()).spawn(move || {
        let _done = done_tx;
        body();
    })?;
    Ok(Worker { name, handle, done })
}

pub struct CapturePipeline {
    camera_id: String,
    render_mode: RenderMode,
    stream: StreamParams,
    processing: ProcessingConfig,
    connector: Arc<dyn Connector>,
    engine: Arc<dyn InferenceEngine>,
    events: Sender<PipelineEvent>,
    shared: Arc<CameraShared>,
    source: Option<Box<dyn FrameSource>>,
    workers: Option<Workers>,
    session: u64,
}

impl CapturePipeline {
    pub fn new(
        camera_id: &str,
        render_mode: RenderMode,
        config: &AppConfig,
        connector: Arc<dyn Connector>,
        engine: Arc<dyn InferenceEngine>,
        events: Sender<PipelineEvent>,
    ) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            render_mode,
            stream: config.stream.clone(),
            processing: config.processing.clone(),
            connector,
            engine,
            events,
            shared: Arc::new(CameraShared {
                camera_id: camera_id.to_string(),
                state: Mutex::new(CameraState::default()),
            }),
            source: None,
            workers: None,
            session: 0,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn view(&self) -> CameraView {
        CameraView {
            shared: self.shared.clone(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().connected
    }

    pub fn is_running(&self) -> bool {
        self.workers.is_some()
    }

    /// 最近一次 start 的会话号, 每次启动递增; 从未启动为 0
    pub fn session(&self) -> u64 {
        self.session
    }

    // ========== 连接 ==========

    /// 打开视频源并探测首帧, 最多 max_attempts 次
    pub fn connect(&mut self, address: &str) -> Result<(), CaptureError> {
        if self.source.is_some() || self.workers.is_some() {
            self.disconnect();
        }
        tracing::info!(camera_id = %self.camera_id, %address, "连接摄像头");

        let mut source = self.connector.open(address, &self.stream)?;

        let attempts = self.stream.max_attempts.max(1);
        let mut probed = false;
        for attempt in 1..=attempts {
            match source.read() {
                Ok(_) => {
                    probed = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(camera_id = %self.camera_id, attempt, error = %e, "探测帧失败");
                    if attempt < attempts {
                        thread::sleep(self.stream.probe_interval());
                    }
                }
            }
        }
        if !probed {
            source.release();
            return Err(CaptureError::NoFrame {
                address: address.to_string(),
                attempts,
            });
        }

        self.source = Some(source);
        self.shared.lock().connected = true;
        tracing::info!(camera_id = %self.camera_id, "摄像头已连接");
        Ok(())
    }

    // ========== 启动 ==========

    /// 启动采集与推理线程; 未连接或已在运行时返回 false
    pub fn start(&mut self) -> bool {
        if self.workers.is_some() {
            tracing::warn!(camera_id = %self.camera_id, "流水线已在运行");
            return false;
        }
        let Some(source) = self.source.take() else {
            tracing::warn!(camera_id = %self.camera_id, "未连接, 无法启动");
            return false;
        };

        self.session += 1;
        let cancel = CancelToken::new();
        let (tx, rx) = crossbeam_channel::bounded::<FrameTask>(self.processing.queue_size.max(1));

        let capture = CaptureLoop {
            shared: self.shared.clone(),
            cancel: cancel.clone(),
            source,
            tx,
            resizer: FrameResizer::new(self.stream.width, self.stream.height),
            frame_skip: self.processing.frame_skip.max(1),
            ring_capacity: self.processing.ring_capacity,
            processing: self.processing.clone(),
        };
        let capture = match spawn_worker(format!("capture-{}", self.camera_id), move || capture.run()) {
            Ok(w) => w,
            Err(e) => {
                tracing::error!(camera_id = %self.camera_id, error = %e, "采集线程启动失败");
                self.reset_state();
                return false;
            }
        };

        let inference = InferenceLoop {
            shared: self.shared.clone(),
            cancel: cancel.clone(),
            rx: rx.clone(),
            engine: self.engine.clone(),
            renderer: Renderer::new(self.render_mode, self.processing.font_path.as_deref()),
            events: self.events.clone(),
            processing: self.processing.clone(),
            session: self.session,
        };
        let inference =
            match spawn_worker(format!("inference-{}", self.camera_id), move || inference.run()) {
                Ok(w) => w,
                Err(e) => {
                    tracing::error!(camera_id = %self.camera_id, error = %e, "推理线程启动失败");
                    cancel.cancel();
                    self.workers = Some(Workers {
                        cancel,
                        threads: vec![capture],
                    });
                    self.disconnect();
                    return false;
                }
            };

        {
            let mut state = self.shared.lock();
            state.processing = true;
            state.queue = Some(rx);
        }
        self.workers = Some(Workers {
            cancel,
            threads: vec![capture, inference],
        });
        tracing::info!(camera_id = %self.camera_id, mode = ?self.render_mode, "开始处理");
        true
    }

    // ========== 断开 ==========

    /// 停止线程 (限时等待), 释放连接, 清空状态; 未连接或未启动时同样安全
    pub fn disconnect(&mut self) {
        if let Some(workers) = self.workers.take() {
            workers.cancel.cancel();
            let deadline = Instant::now() + self.processing.join_timeout();
            for worker in workers.threads {
                match worker.done.recv_deadline(deadline) {
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        tracing::warn!(
                            camera_id = %self.camera_id,
                            thread = %worker.name,
                            "线程未在超时内退出, 放弃等待"
                        );
                    }
                    _ => {
                        if worker.handle.join().is_err() {
                            tracing::error!(camera_id = %self.camera_id, thread = %worker.name, "线程异常退出");
                        }
                    }
                }
            }
        }

        if let Some(mut source) = self.source.take() {
            source.release();
        }

        let was_connected = self.shared.lock().connected;
        self.reset_state();
        if was_connected {
            tracing::info!(camera_id = %self.camera_id, "摄像头已断开");
        }
    }

    fn reset_state(&self) {
        let mut state = self.shared.lock();
        if let Some(queue) = state.queue.take() {
            while queue.try_recv().is_ok() {}
        }
        *state = CameraState::default();
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ========== 采集线程 ==========

/// 缩放到配置分辨率 (fast_image_resize, 失败时退回 image)
struct FrameResizer {
    resizer: fr::Resizer,
    width: u32,
    height: u32,
}

impl FrameResizer {
    fn new(width: u32, height: u32) -> Self {
        Self {
            resizer: fr::Resizer::new(),
            width,
            height,
        }
    }

    fn resize(&mut self, frame: RgbImage) -> RgbImage {
        let (w0, h0) = frame.dimensions();
        if (w0, h0) == (self.width, self.height) || self.width == 0 || self.height == 0 {
            return frame;
        }
        match self.resize_fast(&frame) {
            Some(out) => out,
            None => imageops::resize(&frame, self.width, self.height, imageops::FilterType::Triangle),
        }
    }

    fn resize_fast(&mut self, frame: &RgbImage) -> Option<RgbImage> {
        let (w0, h0) = frame.dimensions();
        let src = fr::images::ImageRef::new(w0, h0, frame.as_raw(), fr::PixelType::U8x3).ok()?;
        let mut dst = fr::images::Image::new(self.width, self.height, fr::PixelType::U8x3);
        self.resizer
            .resize(
                &src,
                &mut dst,
                &fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
            )
            .ok()?;
        RgbImage::from_raw(self.width, self.height, dst.into_vec())
    }
}

struct CaptureLoop {
    shared: Arc<CameraShared>,
    cancel: CancelToken,
    source: Box<dyn FrameSource>,
    tx: Sender<FrameTask>,
    resizer: FrameResizer,
    frame_skip: u64,
    ring_capacity: usize,
    processing: ProcessingConfig,
}

impl CaptureLoop {
    fn run(mut self) {
        let camera_id = self.shared.camera_id.clone();
        tracing::info!(%camera_id, "采集线程启动");

        while !self.cancel.is_cancelled() {
            let frame = match self.source.read() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::trace!(%camera_id, error = %e, "读帧失败, 重试");
                    thread::sleep(self.processing.read_backoff());
                    continue;
                }
            };
            let frame = Arc::new(self.resizer.resize(frame));

            // 1. 发布最新帧
            let seq = {
                let mut state = self.shared.lock();
                if self.cancel.is_cancelled() {
                    break;
                }
                state.latest_raw = Some(frame.clone());
                state.ring.push_front(frame.clone());
                state.ring.truncate(self.ring_capacity);
                state.frame_counter += 1;
                state.frame_counter
            };

            // 2. 每K帧送一次推理, 队列满则丢弃
            if seq % self.frame_skip == 0 {
                match self.tx.try_send(FrameTask { frame, seq }) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.shared.lock().dropped += 1;
                        tracing::trace!(%camera_id, seq, "推理队列已满, 丢帧");
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }

            thread::sleep(self.processing.capture_interval());
        }

        self.source.release();
        tracing::info!(%camera_id, "采集线程退出");
    }
}

// ========== 推理线程 ==========

struct InferenceLoop {
    shared: Arc<CameraShared>,
    cancel: CancelToken,
    rx: Receiver<FrameTask>,
    engine: Arc<dyn InferenceEngine>,
    renderer: Renderer,
    events: Sender<PipelineEvent>,
    processing: ProcessingConfig,
    session: u64,
}

impl InferenceLoop {
    fn run(self) {
        let camera_id = self.shared.camera_id.clone();
        tracing::info!(%camera_id, "推理线程启动");

        let fps_window = self.processing.fps_window.max(1);
        let log_interval = self.processing.log_interval.max(1);
        let mut window_start = Instant::now();
        let mut window_count = 0u64;

        while !self.cancel.is_cancelled() {
            let task = match self.rx.recv_timeout(self.processing.queue_timeout()) {
                Ok(task) => task,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            // 1. 推理, 单帧失败按无检测处理
            let result = match self.engine.predict(&task.frame) {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(%camera_id, seq = task.seq, error = %e, "推理失败");
                    None
                }
            };

            // 2. 分析 + 标注
            let (w, h) = task.frame.dimensions();
            let analysis = analyze(result.as_ref(), w, h, self.processing.mask_threshold);
            let annotated = if analysis.person_present() {
                Arc::new(self.renderer.annotate(&task.frame, &analysis))
            } else {
                task.frame.clone()
            };

            // 3. FPS: 每 fps_window 帧刷新
            window_count += 1;
            let fps = if window_count >= fps_window {
                let elapsed = window_start.elapsed().as_secs_f64();
                window_start = Instant::now();
                window_count = 0;
                (elapsed > 0.0).then(|| fps_window as f64 / elapsed)
            } else {
                None
            };

            // 4. 发布状态
            let processed = {
                let mut state = self.shared.lock();
                if self.cancel.is_cancelled() {
                    break;
                }
                state.latest_annotated = Some(annotated.clone());
                state.area = analysis.area;
                if analysis.area > 0 {
                    state.area_sum += analysis.area as f64;
                    state.frames_with_segmentation += 1;
                }
                if let Some(fps) = fps {
                    state.fps = fps;
                }
                state.processed += 1;
                if state.processed % log_interval == 0 {
                    tracing::info!(
                        %camera_id,
                        processed = state.processed,
                        fps = format_args!("{:.1}", state.fps),
                        dropped = state.dropped,
                        area = state.area,
                        "性能统计"
                    );
                }
                state.processed
            };

            // 5. 事件
            if analysis.person_present() {
                tracing::debug!(%camera_id, seq = task.seq, persons = analysis.persons.len(), "检测到人");
                let _ = self.events.send(PipelineEvent::PersonDetected {
                    camera_id: camera_id.clone(),
                    frame: annotated,
                });
            }
            let _ = self.events.send(PipelineEvent::AreaSample {
                camera_id: camera_id.clone(),
                session: self.session,
                area: analysis.area,
            });
            tracing::trace!(%camera_id, processed, area = analysis.area, "帧处理完成");
        }

        tracing::info!(%camera_id, "推理线程退出");
    }
}
