// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

use chrono::{Duration as ChronoDuration, Local, TimeZone};
use dualcam_rs::detection::{Bbox, DetectionResult, Instance, Mask};
use dualcam_rs::error::SourceError;
use dualcam_rs::{
    AlarmState, AlarmStatistics, AppConfig, Connector, FrameKind, FrameSource, InferenceEngine,
    Orchestrator,
};
use image::{Rgb, RgbImage};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct StillSource;

impl FrameSource for StillSource {
    fn read(&mut self) -> Result<RgbImage, SourceError> {
        Ok(RgbImage::from_pixel(64, 48, Rgb([30, 60, 90])))
    }

    fn release(&mut self) {}
}

struct StillConnector;

impl Connector for StillConnector {
    fn open(
        &self,
        _: &str,
        _: &dualcam_rs::config::StreamParams,
    ) -> Result<Box<dyn FrameSource>, SourceError> {
        Ok(Box::new(StillSource))
    }
}

/// 每帧一个 person, 掩码为左上 side×side 区域
struct PersonEngine {
    side: u32,
}

impl InferenceEngine for PersonEngine {
    fn predict(&self, frame: &RgbImage) -> anyhow::Result<Option<DetectionResult>> {
        let (w, h) = frame.dimensions();
        let side = self.side;
        let mask = Mask::from_fn(w, h, move |x, y| if x < side && y < side { 0.95 } else { 0.0 });
        Ok(Some(DetectionResult::new(vec![Instance::new(
            Bbox::new(0., 0., side as f32, side as f32, 0, 0.88),
            Some(mask),
        )])))
    }
}

fn config(dir: &tempfile::TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.alarms.dir = dir.path().join("alarms");
    config.stream.width = 32;
    config.stream.height = 24;
    config.stream.probe_interval_ms = 1;
    config.processing.capture_interval_ms = 5;
    config.processing.queue_timeout_ms = 20;
    config
}

#[test]
fn test_cooldown_then_evaluate_correct() {
    let dir = tempfile::tempdir().unwrap();
    let o = Orchestrator::new(config(&dir), Arc::new(StillConnector), Arc::new(PersonEngine { side: 2 }))
        .unwrap();
    let alarms = o.alarms();
    let frame = RgbImage::from_pixel(32, 24, Rgb([200, 10, 10]));
    let t0 = Local.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

    assert!(alarms.create_at("camera1", &frame, t0));
    assert!(!alarms.create_at("camera1", &frame, t0 + ChronoDuration::seconds(3)));

    let page = o.pending_alarms(10);
    assert_eq!(page.total_pending, 1);
    let alarm = page.alarms[0].clone();
    assert!(alarm.path.is_file());

    assert!(o.evaluate_alarm(&alarm.id, true));
    assert_eq!(
        o.alarm_statistics(),
        AlarmStatistics {
            total_alarms: 1,
            pending_alarms: 0,
            correct_alarms: 1,
            incorrect_alarms: 0,
            evaluation_percentage: 100.0,
            accuracy_percentage: 100.0,
        }
    );
    assert!(!alarm.path.exists());
    let moved = o.alarm_image(&alarm.filename).unwrap();
    assert_eq!(moved, alarms.dir(AlarmState::Correct).join(&alarm.filename));
    assert!(moved.is_file());
}

#[test]
fn test_live_pipelines_feed_alarms_and_areas() {
    let dir = tempfile::tempdir().unwrap();
    let o = Orchestrator::new(config(&dir), Arc::new(StillConnector), Arc::new(PersonEngine { side: 3 }))
        .unwrap();
    o.connect_camera("camera1", "rtsp://cam1").unwrap();
    o.connect_camera("camera2", "rtsp://cam2").unwrap();

    // 两路各 3x3 掩码 → 乘积 81
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if o.status().area_product == 81 && o.pending_alarms(10).total_pending == 2 {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    let status = o.status();
    assert_eq!(status.area_product, 81);
    assert!(status.cameras.iter().all(|c| c.connected && c.processing));

    // 冷却 5 秒: 每个摄像头只有一条告警
    let page = o.pending_alarms(10);
    assert_eq!(page.total_pending, 2);
    let mut cams: Vec<_> = page.alarms.iter().map(|a| a.camera_id.clone()).collect();
    cams.sort();
    assert_eq!(cams, vec!["camera1", "camera2"]);

    let area = o.area_stats();
    assert_eq!(area.max_product, 81);
    assert!(area.total_calculations > 0);

    let jpeg = o.latest_jpeg("camera2", FrameKind::Annotated).unwrap().unwrap();
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

    // 重连: 先断开再连接
    o.connect_camera("camera1", "rtsp://cam1-b").unwrap();
    o.disconnect_camera("camera2").unwrap();
    assert_eq!(o.area_stats().camera_areas.get("camera2"), Some(&0));
    assert!(!o.status().cameras.iter().any(|c| c.camera_id == "camera2" && c.connected));

    o.shutdown();
    assert!(o.status().cameras.iter().all(|c| !c.connected));
    let perf = o.performance();
    assert!(perf.iter().all(|p| !p.is_running));
}

#[test]
fn test_disconnect_keeps_area_zero_with_backlogged_dispatcher() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    // 大帧 + 无冷却: 每帧写一张告警图, 分发线程积压
    config.stream.width = 1600;
    config.stream.height = 1200;
    config.alarms.cooldown_secs = 0.0;
    config.alarms.max_pending = 5;
    config.processing.frame_skip = 1;
    config.processing.event_capacity = 16;
    let o = Orchestrator::new(config, Arc::new(StillConnector), Arc::new(PersonEngine { side: 1600 }))
        .unwrap();

    for _ in 0..3 {
        o.connect_camera("camera1", "rtsp://cam1").unwrap();
        o.connect_camera("camera2", "rtsp://cam2").unwrap();
        std::thread::sleep(Duration::from_millis(800));

        o.disconnect_camera("camera1").unwrap();
        std::thread::sleep(Duration::from_millis(1500));
        assert_eq!(o.area_stats().camera_areas.get("camera1"), Some(&0));
        assert_eq!(o.status().area_product, 0);
        o.disconnect_camera("camera2").unwrap();
    }
    o.shutdown();
}
