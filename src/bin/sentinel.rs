/// 双摄像头哨兵 (Dual-Camera Sentinel)
///
/// 系统架构:
/// 1. 每个摄像头: 采集线程 + 推理线程 (有界队列, 满则丢帧)
/// 2. 事件分发线程: 告警管理 + 面积乘积统计
/// 3. 主线程:       标准输入控制台
use anyhow::{Context, Result};
use clap::Parser;
use dualcam_rs::detection::YoloSegEngine;
use dualcam_rs::source::FfmpegConnector;
use dualcam_rs::{AppConfig, CancelToken, Orchestrator};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// 哨兵参数
#[derive(Parser, Debug)]
#[command(author, version, about = "双摄像头人员检测与告警", long_about = None)]
struct Args {
    /// 配置文件 (不存在时创建)
    #[arg(short, long, default_value = "sentinel.json")]
    config: PathBuf,

    /// camera1 的 RTSP 地址
    #[arg(long)]
    camera1: Option<String>,

    /// camera2 的 RTSP 地址
    #[arg(long)]
    camera2: Option<String>,

    /// 分割模型 (ONNX)
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// 告警目录
    #[arg(long)]
    alarms_dir: Option<PathBuf>,

    /// 状态日志间隔 (秒), 0 关闭
    #[arg(long, default_value_t = 30)]
    status_interval: u64,

    /// 默认日志级别
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn apply_overrides(config: &mut AppConfig, args: &Args) {
    for (id, address) in [("camera1", &args.camera1), ("camera2", &args.camera2)] {
        if let Some(address) = address {
            if let Some(camera) = config.cameras.iter_mut().find(|c| c.id == id) {
                camera.address = Some(address.clone());
            }
        }
    }
    if let Some(model) = &args.model {
        config.model.path = model.clone();
    }
    if let Some(dir) = &args.alarms_dir {
        config.alarms.dir = dir.clone();
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("序列化失败: {e}"),
    }
}

/// 控制台命令; 返回 false 表示退出
fn handle_command(orchestrator: &Orchestrator, line: &str) -> bool {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        [] => {}
        ["list"] | ["list", _] => {
            let limit = parts.get(1).and_then(|n| n.parse().ok()).unwrap_or(10);
            let page = orchestrator.pending_alarms(limit);
            println!("待评估告警: {} 条", page.total_pending);
            for alarm in &page.alarms {
                println!(
                    "  {}  {}  {}",
                    alarm.id,
                    alarm.camera_id,
                    alarm.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        ["eval", id, verdict] => {
            let is_correct = matches!(*verdict, "y" | "yes" | "correct" | "1");
            if orchestrator.evaluate_alarm(id, is_correct) {
                println!("已评估 {id}");
            } else {
                println!("评估失败 {id}");
            }
        }
        ["stats"] => print_json(&orchestrator.alarm_statistics()),
        ["status"] => {
            print_json(&orchestrator.status());
            print_json(&orchestrator.performance());
            print_json(&orchestrator.area_stats());
        }
        ["connect", camera_id, address] => {
            if let Err(e) = orchestrator.connect_camera(camera_id, address) {
                println!("连接失败: {e}");
            }
        }
        ["disconnect", camera_id] => {
            if let Err(e) = orchestrator.disconnect_camera(camera_id) {
                println!("断开失败: {e}");
            }
        }
        ["quit"] | ["exit"] => return false,
        _ => println!(
            "命令: list [n] | eval <id> y|n | stats | status | connect <camera> <url> | disconnect <camera> | quit"
        ),
    }
    true
}

fn main() -> Result<()> {
    let args = Args::parse();
    dualcam_rs::init_logging(&args.log_level);

    let mut config = AppConfig::load(&args.config);
    apply_overrides(&mut config, &args);

    // ========== 加载模型 ==========
    let engine = YoloSegEngine::new(&config.model)
        .with_context(|| format!("加载模型失败: {}", config.model.path.display()))?;

    // ========== 启动流水线 ==========
    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        Arc::new(FfmpegConnector),
        Arc::new(engine),
    )?);
    for camera in &config.cameras {
        let Some(address) = &camera.address else {
            tracing::warn!(camera_id = %camera.id, "未配置地址, 跳过");
            continue;
        };
        if let Err(e) = orchestrator.connect_camera(&camera.id, address) {
            tracing::error!(camera_id = %camera.id, error = %e, "摄像头连接失败");
        }
    }

    // ========== 状态日志线程 ==========
    let cancel = CancelToken::new();
    let status_thread = (args.status_interval > 0).then(|| {
        let (orchestrator, cancel) = (orchestrator.clone(), cancel.clone());
        let interval = Duration::from_secs(args.status_interval);
        std::thread::spawn(move || {
            let mut last = Instant::now();
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(200));
                if last.elapsed() < interval {
                    continue;
                }
                last = Instant::now();
                for perf in orchestrator.performance() {
                    tracing::info!(
                        camera_id = %perf.camera_id,
                        running = perf.is_running,
                        fps = perf.fps,
                        processed = perf.processed_frames,
                        dropped = perf.dropped_frames,
                        area = perf.segmentation_area,
                        "摄像头状态"
                    );
                }
                let area = orchestrator.area_stats();
                tracing::info!(product = area.current_product, max = area.max_product, "面积乘积");
            }
        })
    });

    // ========== 主线程: 控制台 ==========
    println!("系统就绪, 输入 help 查看命令");
    let stdin = std::io::stdin();
    let mut quit = false;
    for line in stdin.lock().lines() {
        let Ok(line) = line else {
            break;
        };
        if !handle_command(&orchestrator, line.trim()) {
            quit = true;
            break;
        }
    }

    // stdin 关闭时持续运行, 直到进程被终止
    if !quit {
        tracing::info!("标准输入已关闭, 以无控制台模式运行");
        if let Some(handle) = status_thread {
            let _ = handle.join();
        } else {
            loop {
                std::thread::park();
            }
        }
        return Ok(());
    }

    cancel.cancel();
    if let Some(handle) = status_thread {
        let _ = handle.join();
    }
    orchestrator.shutdown();
    Ok(())
}
