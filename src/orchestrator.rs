// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 编排: 每个摄像头一条流水线, 事件分发线程把 PipelineEvent 交给告警管理和面积统计

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::alarm::{Alarm, AlarmManager, AlarmStatistics};
use crate::area::{AreaAggregator, AreaStats};
use crate::capture::{
    CameraStatus, CameraView, CancelToken, CapturePipeline, FrameKind, PerformanceStats,
    PipelineEvent,
};
use crate::config::AppConfig;
use crate::detection::InferenceEngine;
use crate::error::{ControlError, Result};
use crate::source::Connector;

const DISPATCH_POLL: Duration = Duration::from_millis(100);

/// 待评估告警的一页
#[derive(Clone, Debug, Serialize)]
pub struct PendingPage {
    pub alarms: Vec<Alarm>,
    pub total_pending: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemStatus {
    pub cameras: Vec<CameraStatus>,
    pub area_product: u64,
}

struct CameraSlot {
    pipeline: Mutex<CapturePipeline>,
    view: CameraView,
}

impl CameraSlot {
    fn lock(&self) -> MutexGuard<'_, CapturePipeline> {
        self.pipeline.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Dispatcher {
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

pub struct Orchestrator {
    config: AppConfig,
    cameras: BTreeMap<String, CameraSlot>,
    alarms: Arc<AlarmManager>,
    areas: Arc<AreaAggregator>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        connector: Arc<dyn Connector>,
        engine: Arc<dyn InferenceEngine>,
    ) -> Result<Self> {
        let alarms = Arc::new(AlarmManager::open(&config.alarms)?);
        let areas = Arc::new(AreaAggregator::new(config.camera_ids()));

        let (tx, rx) = crossbeam_channel::bounded(config.processing.event_capacity.max(1));
        let cameras = config
            .cameras
            .iter()
            .map(|camera| {
                let pipeline = CapturePipeline::new(
                    &camera.id,
                    camera.render_mode,
                    &config,
                    connector.clone(),
                    engine.clone(),
                    tx.clone(),
                );
                let view = pipeline.view();
                (
                    camera.id.clone(),
                    CameraSlot {
                        pipeline: Mutex::new(pipeline),
                        view,
                    },
                )
            })
            .collect();

        let cancel = CancelToken::new();
        let handle = {
            let (cancel, alarms, areas) = (cancel.clone(), alarms.clone(), areas.clone());
            thread::Builder::new()
                .name("event-dispatcher".into())
                .spawn(move || dispatch_loop(rx, cancel, &alarms, &areas))
                .map_err(|e| ControlError::Capture(e.into()))?
        };

        tracing::info!(cameras = ?config.camera_ids(), alarms_dir = %config.alarms.dir.display(), "系统初始化完成");
        Ok(Self {
            config,
            cameras,
            alarms,
            areas,
            dispatcher: Mutex::new(Some(Dispatcher { cancel, handle })),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn alarms(&self) -> &Arc<AlarmManager> {
        &self.alarms
    }

    pub fn areas(&self) -> &Arc<AreaAggregator> {
        &self.areas
    }

    fn slot(&self, camera_id: &str) -> Result<&CameraSlot> {
        self.cameras
            .get(camera_id)
            .ok_or_else(|| ControlError::UnknownCamera(camera_id.to_string()))
    }

    // ========== 控制 ==========

    /// 已连接时先断开再重连, 连接成功后立即开始处理
    pub fn connect_camera(&self, camera_id: &str, address: &str) -> Result<()> {
        let slot = self.slot(camera_id)?;
        let mut pipeline = slot.lock();
        if pipeline.is_connected() || pipeline.is_running() {
            pipeline.disconnect();
            self.areas.close_session(camera_id, pipeline.session());
        }
        pipeline.connect(address)?;
        if !pipeline.start() {
            pipeline.disconnect();
            return Err(ControlError::StartFailed(camera_id.to_string()));
        }
        Ok(())
    }

    pub fn disconnect_camera(&self, camera_id: &str) -> Result<()> {
        let slot = self.slot(camera_id)?;
        let mut pipeline = slot.lock();
        pipeline.disconnect();
        // 通道中尚未分发的旧样本随会话一起作废
        self.areas.close_session(camera_id, pipeline.session());
        Ok(())
    }

    pub fn pending_alarms(&self, limit: usize) -> PendingPage {
        let (alarms, total_pending) = self.alarms.list_pending(limit);
        PendingPage {
            alarms,
            total_pending,
        }
    }

    pub fn evaluate_alarm(&self, alarm_id: &str, is_correct: bool) -> bool {
        self.alarms.evaluate(alarm_id, is_correct)
    }

    pub fn alarm_statistics(&self) -> AlarmStatistics {
        self.alarms.statistics()
    }

    pub fn alarm_image(&self, filename: &str) -> Option<PathBuf> {
        self.alarms.find_image(filename)
    }

    // ========== 只读状态 ==========

    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            cameras: self.cameras.values().map(|s| s.view.status()).collect(),
            area_product: self.areas.current_product(),
        }
    }

    pub fn performance(&self) -> Vec<PerformanceStats> {
        self.cameras.values().map(|s| s.view.performance()).collect()
    }

    pub fn area_stats(&self) -> AreaStats {
        self.areas.snapshot()
    }

    pub fn latest_jpeg(&self, camera_id: &str, kind: FrameKind) -> Result<Option<Vec<u8>>> {
        let slot = self.slot(camera_id)?;
        Ok(slot
            .view
            .latest_jpeg(kind, self.config.processing.jpeg_quality))
    }

    // ========== 关闭 ==========

    /// 断开所有摄像头, 停止分发线程, 保存统计; 可重复调用
    pub fn shutdown(&self) {
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(dispatcher) = dispatcher else {
            return;
        };

        tracing::info!("系统关闭中");
        for (camera_id, slot) in &self.cameras {
            let mut pipeline = slot.lock();
            pipeline.disconnect();
            self.areas.close_session(camera_id, pipeline.session());
        }

        dispatcher.cancel.cancel();
        if dispatcher.handle.join().is_err() {
            tracing::error!("事件分发线程异常退出");
        }

        if let Err(e) = self.alarms.save_statistics() {
            tracing::error!(error = %e, "保存告警统计失败");
        }
        let stats = self.areas.snapshot();
        tracing::info!(
            max_product = stats.max_product,
            average_product = stats.average_product,
            total_calculations = stats.total_calculations,
            non_zero_products = stats.non_zero_products,
            "最终面积统计"
        );
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 把一个事件交给对应的消费者
pub fn handle_event(event: PipelineEvent, alarms: &AlarmManager, areas: &AreaAggregator) {
    match event {
        PipelineEvent::PersonDetected { camera_id, frame } => {
            alarms.create(&camera_id, &frame);
        }
        PipelineEvent::AreaSample {
            camera_id,
            session,
            area,
        } => areas.update_session(&camera_id, session, area),
    }
}

fn dispatch_loop(
    rx: Receiver<PipelineEvent>,
    cancel: CancelToken,
    alarms: &AlarmManager,
    areas: &AreaAggregator,
) {
    tracing::debug!("事件分发线程启动");
    while !cancel.is_cancelled() {
        match rx.recv_timeout(DISPATCH_POLL) {
            Ok(event) => handle_event(event, alarms, areas),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    // 处理剩余事件
    while let Ok(event) = rx.try_recv() {
        handle_event(event, alarms, areas);
    }
    tracing::debug!("事件分发线程退出");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::AlarmState;
    use image::RgbImage;

    struct NoEngine;

    impl InferenceEngine for NoEngine {
        fn predict(&self, _: &RgbImage) -> anyhow::Result<Option<crate::detection::DetectionResult>> {
            Ok(None)
        }
    }

    struct NoConnector;

    impl Connector for NoConnector {
        fn open(
            &self,
            address: &str,
            _: &crate::config::StreamParams,
        ) -> std::result::Result<Box<dyn crate::source::FrameSource>, crate::error::SourceError> {
            Err(crate::error::SourceError::Open {
                address: address.into(),
                reason: "offline".into(),
            })
        }
    }

    fn orchestrator(dir: &tempfile::TempDir) -> Orchestrator {
        let mut config = AppConfig::default();
        config.alarms.dir = dir.path().to_path_buf();
        Orchestrator::new(config, Arc::new(NoConnector), Arc::new(NoEngine)).unwrap()
    }

    #[test]
    fn test_unknown_camera() {
        let dir = tempfile::tempdir().unwrap();
        let o = orchestrator(&dir);
        assert!(matches!(
            o.connect_camera("camera9", "rtsp://x"),
            Err(ControlError::UnknownCamera(_))
        ));
        assert!(o.latest_jpeg("camera9", FrameKind::Raw).is_err());
    }

    #[test]
    fn test_connect_error_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let o = orchestrator(&dir);
        assert!(matches!(
            o.connect_camera("camera1", "rtsp://x"),
            Err(ControlError::Capture(_))
        ));
        assert!(o.status().cameras.iter().all(|c| !c.connected));
        assert_eq!(o.latest_jpeg("camera1", FrameKind::Raw).unwrap(), None);
    }

    #[test]
    fn test_handle_event_routes() {
        let dir = tempfile::tempdir().unwrap();
        let o = orchestrator(&dir);
        handle_event(
            PipelineEvent::AreaSample {
                camera_id: "camera1".into(),
                session: 1,
                area: 6,
            },
            o.alarms(),
            o.areas(),
        );
        handle_event(
            PipelineEvent::AreaSample {
                camera_id: "camera2".into(),
                session: 1,
                area: 7,
            },
            o.alarms(),
            o.areas(),
        );
        assert_eq!(o.status().area_product, 42);

        handle_event(
            PipelineEvent::PersonDetected {
                camera_id: "camera2".into(),
                frame: Arc::new(RgbImage::new(8, 8)),
            },
            o.alarms(),
            o.areas(),
        );
        let page = o.pending_alarms(10);
        assert_eq!(page.total_pending, 1);
        assert_eq!(page.alarms[0].camera_id, "camera2");
        assert_eq!(page.alarms[0].state, AlarmState::Pending);
    }

    #[test]
    fn test_disconnect_zeroes_area_and_shutdown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let o = orchestrator(&dir);
        o.areas().update("camera1", 5);
        o.areas().update("camera2", 5);
        o.disconnect_camera("camera1").unwrap();
        assert_eq!(o.area_stats().camera_areas.get("camera1"), Some(&0));
        assert_eq!(o.area_stats().current_product, 0);
        o.shutdown();
        o.shutdown();
        assert!(o.alarms().statistics_path().is_file());
    }
}
